//! In-process transport.
//!
//! [`memory_pair`] returns a transport for a session and the peer end that
//! plays the router. Messages are passed through a serializer on the way so
//! the wire shapes are exercised exactly as on a socket.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use wamp_core::codec::Serializer;
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::Message;
use wamp_core::transport::{Transport, TransportEvent};

/// Create a connected transport/peer pair using JSON round-trips.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    memory_pair_with(Some(Serializer::Json))
}

/// Like [`memory_pair`], with a chosen serializer (`None` passes messages
/// through untouched).
pub fn memory_pair_with(serializer: Option<Serializer>) -> (MemoryTransport, MemoryPeer) {
    let (to_peer, from_session) = mpsc::unbounded_channel();
    let (to_session, from_peer) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            serializer,
            to_peer: Some(to_peer),
            from_peer,
            opened: false,
        },
        MemoryPeer {
            serializer,
            from_session,
            to_session,
        },
    )
}

fn round_trip(serializer: Option<Serializer>, message: Message) -> WampResult<Message> {
    match serializer {
        Some(serializer) => serializer.decode(&serializer.encode(&message)?),
        None => Ok(message),
    }
}

/// Session end of an in-memory connection.
pub struct MemoryTransport {
    serializer: Option<Serializer>,
    to_peer: Option<mpsc::UnboundedSender<Message>>,
    from_peer: mpsc::UnboundedReceiver<TransportEvent>,
    opened: bool,
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            match &self.to_peer {
                Some(tx) if !tx.is_closed() => {
                    self.opened = true;
                    Ok(())
                }
                _ => Err(WampError::Transport("memory peer is gone".into())),
            }
        })
    }

    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            let tx = self
                .to_peer
                .as_ref()
                .filter(|_| self.opened)
                .ok_or_else(|| WampError::Transport("memory transport not open".into()))?;
            let message = round_trip(self.serializer, message)?;
            tx.send(message)
                .map_err(|_| WampError::Transport("memory peer is gone".into()))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, TransportEvent> {
        Box::pin(async move {
            self.from_peer
                .recv()
                .await
                .unwrap_or(TransportEvent::Closed {
                    was_clean: false,
                    reason: Some("memory peer dropped".into()),
                })
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            self.to_peer = None;
            self.opened = false;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.opened && self.to_peer.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Router end of an in-memory connection.
pub struct MemoryPeer {
    serializer: Option<Serializer>,
    from_session: mpsc::UnboundedReceiver<Message>,
    to_session: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Next message from the session; `None` once it closed the transport.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_session.recv().await
    }

    /// Deliver a message to the session.
    pub fn send(&self, message: Message) -> WampResult<()> {
        let message = round_trip(self.serializer, message)?;
        self.to_session
            .send(TransportEvent::Message(message))
            .map_err(|_| WampError::Transport("memory transport is gone".into()))
    }

    /// End the connection from the router side.
    pub fn close(self, was_clean: bool, reason: Option<String>) {
        let _ = self
            .to_session
            .send(TransportEvent::Closed { was_clean, reason });
    }
}
