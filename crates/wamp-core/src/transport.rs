//! Abstract transport contract for WAMP sessions.
//!
//! The session engine only ever talks to a transport through this trait. An
//! application picks a concrete implementation and hands it to the session.

use futures_util::future::BoxFuture;

use crate::error::WampResult;
use crate::messages::Message;

/// Something delivered by a transport to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded inbound message.
    Message(Message),
    /// The transport is gone. No further events follow.
    Closed {
        was_clean: bool,
        reason: Option<String>,
    },
}

/// Bidirectional message channel to a router.
///
/// Methods return boxed futures so the trait stays object-safe and the
/// futures are `Send`.
pub trait Transport: Send {
    /// Establish the connection (socket connect, subprotocol negotiation).
    fn open(&mut self) -> BoxFuture<'_, WampResult<()>>;

    /// Send one message. Messages are delivered in send order.
    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>>;

    /// Wait for the next inbound event.
    ///
    /// Must be cancel-safe: dropping the future before it completes may not
    /// lose a message.
    fn recv(&mut self) -> BoxFuture<'_, TransportEvent>;

    /// Close the connection.
    fn close(&mut self) -> BoxFuture<'_, WampResult<()>>;

    /// Whether the transport is still connected.
    fn is_connected(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> BoxFuture<'_, WampResult<()>> {
        (**self).open()
    }

    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>> {
        (**self).send(message)
    }

    fn recv(&mut self) -> BoxFuture<'_, TransportEvent> {
        (**self).recv()
    }

    fn close(&mut self) -> BoxFuture<'_, WampResult<()>> {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
