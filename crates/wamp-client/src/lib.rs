//! wamp-client: async WAMP v2 client session engine.
//!
//! A [`Session`] joins one realm on a router over an injected transport and
//! multiplexes remote procedure calls, registrations, publications and
//! subscriptions over it. A single sequencer task per connection owns all
//! protocol state; session handles talk to it through a command queue and
//! get [`Pending`] futures back.
//!
//! # Quick Start
//!
//! ```no_run
//! use wamp_client::{CallOptions, Dict, Session, SessionConfig, WebSocketTransport};
//! use wamp_core::Serializer;
//!
//! # async fn example() -> wamp_core::WampResult<()> {
//! let session = Session::new(SessionConfig::default());
//! let transport = WebSocketTransport::new("ws://127.0.0.1:8080/ws", Serializer::Json);
//! session.connect(transport)?.await?;
//!
//! let result = session
//!     .call("com.example.add2", vec![2.into(), 3.into()], Dict::new(), CallOptions::default())?
//!     .await?;
//! println!("{:?}", result.args);
//!
//! session.leave(None, None)?.await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod dispatcher;
pub mod lifecycle;
pub mod pending;
mod sequencer;
pub mod session;
pub mod transport;
pub mod types;

// Re-export primary public types.
pub use auth::{
    AnonymousAuth, Authenticator, Challenge, CraAuth, Credentials, CryptosignAuth, TicketAuth,
};
pub use client::{Client, RetryPolicy, TransportFactory};
pub use dispatcher::{EventHandler, InvocationOutcome, Procedure};
pub use pending::{Pending, RequestKind};
pub use session::{Session, SessionConfig};
pub use transport::{
    memory_pair, MemoryPeer, MemoryTransport, RawSocketTransport, TransportKind,
    WebSocketTransport,
};
pub use types::*;

// Re-export wamp-core types for convenience.
pub use wamp_core::{Dict, List, WampError, WampResult};
