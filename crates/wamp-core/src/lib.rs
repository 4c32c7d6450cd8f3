//! wamp-core: Shared protocol library for WAMP clients.
//!
//! Provides the WAMP v2 message model, JSON/CBOR serializers, RawSocket
//! framing, URI validation, request-id generation, and the abstract
//! transport contract the session engine is written against.

pub mod codec;
pub mod error;
pub mod id;
pub mod messages;
pub mod transport;
pub mod uri;

// Re-export commonly used items at crate root.
pub use codec::{FrameDecoder, FrameKind, Serializer};
pub use error::{WampError, WampResult};
pub use id::IdGenerator;
pub use messages::{to_dict, uris, Dict, Id, List, Message, MessageType, MAX_ID};
pub use transport::{Transport, TransportEvent};
pub use uri::validate_uri;
