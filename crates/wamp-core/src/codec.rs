//! Message serializers and RawSocket framing.
//!
//! Serializers turn a [`Message`] into bytes for a transport. RawSocket adds a
//! 4-byte frame header on top: `[frame type][24-bit big-endian length]`.

use std::io::Cursor;

use crate::error::{WampError, WampResult};
use crate::messages::Message;

/// WebSocket subprotocol name for JSON.
pub const SUBPROTOCOL_JSON: &str = "wamp.2.json";
/// WebSocket subprotocol name for CBOR.
pub const SUBPROTOCOL_CBOR: &str = "wamp.2.cbor";

/// Wire serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    #[default]
    Json,
    Cbor,
}

impl Serializer {
    /// WebSocket subprotocol identifier.
    pub fn subprotocol(self) -> &'static str {
        match self {
            Self::Json => SUBPROTOCOL_JSON,
            Self::Cbor => SUBPROTOCOL_CBOR,
        }
    }

    /// Resolve a negotiated subprotocol back to a serializer.
    pub fn from_subprotocol(name: &str) -> Option<Self> {
        match name {
            SUBPROTOCOL_JSON => Some(Self::Json),
            SUBPROTOCOL_CBOR => Some(Self::Cbor),
            _ => None,
        }
    }

    /// RawSocket serializer code (lower nibble of the handshake's second byte).
    pub fn rawsocket_code(self) -> u8 {
        match self {
            Self::Json => 1,
            Self::Cbor => 3,
        }
    }

    /// Whether encoded messages are binary (CBOR) or text (JSON).
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Cbor)
    }

    pub fn encode(self, message: &Message) -> WampResult<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(message)?),
            Self::Cbor => {
                let mut out = Vec::new();
                ciborium::into_writer(message, &mut out)?;
                Ok(out)
            }
        }
    }

    pub fn decode(self, data: &[u8]) -> WampResult<Message> {
        match self {
            Self::Json => Ok(serde_json::from_slice(data)?),
            Self::Cbor => Ok(ciborium::from_reader(Cursor::new(data))?),
        }
    }
}

/// Magic first byte of a RawSocket handshake.
pub const RAWSOCKET_MAGIC: u8 = 0x7F;

/// Largest frame a RawSocket peer may announce (2^24 bytes).
pub const RAWSOCKET_MAX_LENGTH_EXP: u8 = 15;

/// RawSocket frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message = 0,
    Ping = 1,
    Pong = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = WampError;

    fn try_from(v: u8) -> Result<Self, WampError> {
        match v {
            0 => Ok(Self::Message),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            _ => Err(WampError::Protocol(format!(
                "unknown rawsocket frame type: {v}"
            ))),
        }
    }
}

/// Build the 4-byte client handshake.
///
/// `max_len_exp` announces the largest frame we accept as `2^(9 + exp)`.
pub fn rawsocket_handshake(serializer: Serializer, max_len_exp: u8) -> [u8; 4] {
    let exp = max_len_exp.min(RAWSOCKET_MAX_LENGTH_EXP);
    [
        RAWSOCKET_MAGIC,
        (exp << 4) | serializer.rawsocket_code(),
        0x00,
        0x00,
    ]
}

/// Validate the router's handshake reply and return the router's maximum frame length.
pub fn parse_rawsocket_reply(reply: [u8; 4], serializer: Serializer) -> WampResult<usize> {
    if reply[0] != RAWSOCKET_MAGIC {
        return Err(WampError::Transport(format!(
            "invalid rawsocket magic: 0x{:02x}",
            reply[0]
        )));
    }
    let low = reply[1] & 0x0F;
    let high = reply[1] >> 4;
    if low == 0 {
        let reason = match high {
            0 => "illegal",
            1 => "serializer unsupported",
            2 => "maximum message length unacceptable",
            3 => "use of reserved bits",
            4 => "maximum connection count reached",
            _ => "unknown error",
        };
        return Err(WampError::Transport(format!(
            "router rejected rawsocket handshake: {reason}"
        )));
    }
    if low != serializer.rawsocket_code() {
        return Err(WampError::Transport(format!(
            "router answered with serializer {low}, expected {}",
            serializer.rawsocket_code()
        )));
    }
    Ok(1usize << (9 + u32::from(high)))
}

/// Encode a RawSocket frame: `[kind][24-bit BE length][payload]`.
pub fn frame_encode(kind: FrameKind, payload: &[u8]) -> WampResult<Vec<u8>> {
    let len = payload.len();
    if len >= 1 << 24 {
        return Err(WampError::Codec(format!("frame too large: {len} bytes")));
    }
    let mut frame = Vec::with_capacity(4 + len);
    frame.push(kind as u8);
    frame.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Streaming RawSocket decoder: accumulates bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Largest payload accepted, as announced in our handshake.
    max_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(usize::MAX)
    }

    /// Decoder that refuses frames whose header announces more than `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Feed raw bytes and return all complete `(kind, payload)` frames.
    pub fn feed(&mut self, data: &[u8]) -> WampResult<Vec<(FrameKind, Vec<u8>)>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let kind = FrameKind::try_from(self.buffer[0] & 0x07)?;
            let len =
                u32::from_be_bytes([0, self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
            if len > self.max_len {
                return Err(WampError::Protocol(format!(
                    "rawsocket frame of {len} bytes exceeds limit of {} bytes",
                    self.max_len
                )));
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            let payload = self.buffer[4..4 + len].to_vec();
            frames.push((kind, payload));
            self.buffer.drain(..4 + len);
        }

        Ok(frames)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{to_dict, Dict};
    use serde_json::json;

    fn sample() -> Message {
        Message::Event {
            subscription: 9,
            publication: 11,
            details: Dict::new(),
            args: Some(vec![json!(1), json!("Rust")]),
            kwargs: Some(to_dict(json!({"k": true}))),
        }
    }

    #[test]
    fn json_wire_text() {
        let bytes = Serializer::Json.encode(&sample()).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"[36,9,11,{},[1,"Rust"],{"k":true}]"#
        );
    }

    #[test]
    fn cbor_decodes_what_it_encodes() {
        let bytes = Serializer::Cbor.encode(&sample()).unwrap();
        assert_eq!(Serializer::Cbor.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn json_decode_rejects_non_list() {
        let err = Serializer::Json.decode(br#"{"type": 1}"#).unwrap_err();
        assert!(matches!(err, WampError::Codec(_)));
    }

    #[test]
    fn subprotocol_names() {
        assert_eq!(Serializer::Json.subprotocol(), "wamp.2.json");
        assert_eq!(
            Serializer::from_subprotocol("wamp.2.cbor"),
            Some(Serializer::Cbor)
        );
        assert_eq!(Serializer::from_subprotocol("wamp.2.msgpack"), None);
    }

    #[test]
    fn handshake_bytes() {
        assert_eq!(
            rawsocket_handshake(Serializer::Json, 15),
            [0x7F, 0xF1, 0x00, 0x00]
        );
    }

    #[test]
    fn handshake_reply_accepted() {
        let max = parse_rawsocket_reply([0x7F, 0x31, 0, 0], Serializer::Json).unwrap();
        assert_eq!(max, 1 << 12);
    }

    #[test]
    fn handshake_reply_error_code() {
        let err = parse_rawsocket_reply([0x7F, 0x10, 0, 0], Serializer::Json).unwrap_err();
        assert!(err.to_string().contains("serializer unsupported"));
    }

    #[test]
    fn frame_header_layout() {
        let frame = frame_encode(FrameKind::Ping, b"abc").unwrap();
        assert_eq!(frame, vec![1, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn incremental_feed() {
        let payload = Serializer::Json.encode(&sample()).unwrap();
        let frame = frame_encode(FrameKind::Message, &payload).unwrap();
        let mut decoder = FrameDecoder::new();

        for byte in &frame[..frame.len() - 1] {
            assert!(decoder.feed(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let frames = decoder.feed(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FrameKind::Message);
        assert_eq!(Serializer::Json.decode(&frames[0].1).unwrap(), sample());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut combined = frame_encode(FrameKind::Ping, b"p").unwrap();
        combined.extend(frame_encode(FrameKind::Message, b"[]").unwrap());
        let frames = FrameDecoder::new().feed(&combined).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].0, FrameKind::Message);
    }

    #[test]
    fn oversized_frame_rejected_from_header() {
        let mut decoder = FrameDecoder::with_max_len(512);
        let fits = frame_encode(FrameKind::Message, &[b'x'; 512]).unwrap();
        assert_eq!(decoder.feed(&fits).unwrap().len(), 1);

        // Only the header has arrived: the announced length alone is enough.
        let big = frame_encode(FrameKind::Message, &[b'x'; 2048]).unwrap();
        let err = decoder.feed(&big[..4]).unwrap_err();
        assert!(matches!(err, WampError::Protocol(_)));

        let err = FrameDecoder::with_max_len(512).feed(&big).unwrap_err();
        assert!(err.to_string().contains("exceeds limit of 512 bytes"));
    }
}
