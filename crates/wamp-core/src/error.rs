use thiserror::Error;

use crate::messages::{Dict, Id, List};

/// Errors produced by the WAMP protocol layer and the session engine.
#[derive(Debug, Clone, Error)]
pub enum WampError {
    /// Operation attempted while the session is not joined to a realm.
    #[error("session is not connected")]
    NotConnected,

    /// `connect` called on a session that is already connecting or joined.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("no authenticator accepts method '{method}'")]
    NoMatchingAuthenticator { method: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The router refused the session (ABORT during the opening handshake).
    #[error("session aborted: {reason}")]
    Aborted {
        reason: String,
        message: Option<String>,
    },

    /// A pending operation was cut short by the session going away.
    #[error("connection closed")]
    ConnectionClosed,

    /// The router returned an application error for a call.
    #[error("call failed: {error}")]
    CallFailed {
        error: String,
        args: List,
        kwargs: Dict,
    },

    #[error("register failed: {0}")]
    RegisterFailed(String),

    #[error("unregister failed: {0}")]
    UnregisterFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("no such registration: {0}")]
    NoSuchRegistration(Id),

    #[error("no such subscription: {0}")]
    NoSuchSubscription(Id),

    /// An event arrived for a subscription id with no local handlers.
    #[error("event dropped for unknown subscription {0}")]
    DroppedEvent(Id),

    #[error("duplicate request id {id} for {kind}")]
    DuplicateRequestId { id: Id, kind: String },

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for WampError {
    fn from(e: std::io::Error) -> Self {
        WampError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for WampError {
    fn from(e: serde_json::Error) -> Self {
        WampError::Codec(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for WampError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        WampError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for WampError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        WampError::Codec(e.to_string())
    }
}

pub type WampResult<T> = Result<T, WampError>;
