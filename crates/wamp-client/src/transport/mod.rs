//! Concrete transports.
//!
//! The kind is chosen from the router URL scheme:
//! - `ws://` or `wss://` → WebSocket
//! - `tcp://` or `rs://` → RawSocket
//!
//! In-process wiring and tests use [`memory_pair`].

pub mod memory;
pub mod rawsocket;
pub mod websocket;

pub use memory::{memory_pair, memory_pair_with, MemoryPeer, MemoryTransport};
pub use rawsocket::RawSocketTransport;
pub use websocket::WebSocketTransport;

use wamp_core::codec::Serializer;
use wamp_core::error::{WampError, WampResult};
use wamp_core::transport::Transport;

/// Transport kind, inferred from the router URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    RawSocket,
}

/// Determine the transport kind from a URL string.
pub fn detect_transport(url: &str) -> WampResult<TransportKind> {
    let lower = url.to_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(TransportKind::WebSocket)
    } else if lower.starts_with("tcp://") || lower.starts_with("rs://") {
        Ok(TransportKind::RawSocket)
    } else {
        Err(WampError::Transport(format!(
            "unsupported URL scheme: {url} (expected ws://, wss://, tcp://, or rs://)"
        )))
    }
}

/// Build an unopened transport for `url`.
pub fn transport_for_url(url: &str, serializer: Serializer) -> WampResult<Box<dyn Transport>> {
    match detect_transport(url)? {
        TransportKind::WebSocket => Ok(Box::new(WebSocketTransport::new(url, serializer))),
        TransportKind::RawSocket => Ok(Box::new(RawSocketTransport::new(
            parse_rawsocket_url(url)?,
            serializer,
        ))),
    }
}

/// Parse a RawSocket URL into `host:port`.
fn parse_rawsocket_url(url: &str) -> WampResult<String> {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| WampError::Transport(format!("invalid RawSocket URL: {url}")))?;

    // Strip path
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    if host_port.is_empty() {
        return Err(WampError::Transport(format!("RawSocket URL has no host: {url}")));
    }
    if !host_port.contains(':') {
        return Err(WampError::Transport(format!("RawSocket URL needs a port: {url}")));
    }
    Ok(host_port.to_string())
}
