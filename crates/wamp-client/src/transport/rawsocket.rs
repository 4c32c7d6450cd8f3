//! RawSocket transport: WAMP over a plain TCP stream.
//!
//! After the 4-byte handshake every message travels in a frame with a
//! `[type][24-bit length]` header. Router pings are answered by the reader
//! task with a pong echoing the payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use wamp_core::codec::{
    frame_encode, parse_rawsocket_reply, rawsocket_handshake, FrameDecoder, FrameKind, Serializer,
    RAWSOCKET_MAX_LENGTH_EXP,
};
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::Message;
use wamp_core::transport::{Transport, TransportEvent};

const READ_BUFFER: usize = 16 * 1024;
const INBOUND_CAPACITY: usize = 256;

type Writer = Arc<Mutex<OwnedWriteHalf>>;

/// WAMP over RawSocket (TCP).
pub struct RawSocketTransport {
    addr: String,
    serializer: Serializer,
    max_len_exp: u8,
    /// Largest message the router accepts, learned from the handshake.
    router_max_len: usize,
    writer: Option<Writer>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl RawSocketTransport {
    /// `addr` is `host:port`.
    pub fn new(addr: impl Into<String>, serializer: Serializer) -> Self {
        Self {
            addr: addr.into(),
            serializer,
            max_len_exp: RAWSOCKET_MAX_LENGTH_EXP,
            router_max_len: 0,
            writer: None,
            inbound: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Announce a smaller maximum inbound message size, `2^(9 + exp)` bytes.
    pub fn with_max_len_exp(mut self, exp: u8) -> Self {
        self.max_len_exp = exp.min(RAWSOCKET_MAX_LENGTH_EXP);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&mut self) -> WampResult<()> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| WampError::Transport(format!("connect to {} failed: {e}", self.addr)))?;
        stream.set_nodelay(true)?;

        stream
            .write_all(&rawsocket_handshake(self.serializer, self.max_len_exp))
            .await?;
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        self.router_max_len = parse_rawsocket_reply(reply, self.serializer)?;

        tracing::info!(
            "RawSocket connected to {} (max message {} bytes)",
            self.addr,
            self.router_max_len
        );

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        self.connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(
            read_half,
            self.serializer,
            1usize << (9 + u32::from(self.max_len_exp)),
            inbound_tx,
            writer.clone(),
            self.connected.clone(),
        ));

        self.writer = Some(writer);
        self.inbound = Some(inbound_rx);
        self.reader = Some(reader);
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> WampResult<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| WampError::Transport("RawSocket not open".into()))?;

        let payload = self.serializer.encode(&message)?;
        if payload.len() > self.router_max_len {
            return Err(WampError::Transport(format!(
                "{} message of {} bytes exceeds the router limit of {}",
                message.message_type(),
                payload.len(),
                self.router_max_len
            )));
        }
        let frame = frame_encode(FrameKind::Message, &payload)?;
        writer.lock().await.write_all(&frame).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> WampResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(writer) = self.writer.take() {
            let _ = writer.lock().await.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound = None;
        Ok(())
    }
}

impl Transport for RawSocketTransport {
    fn open(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(self.connect())
    }

    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(self.send_message(message))
    }

    fn recv(&mut self) -> BoxFuture<'_, TransportEvent> {
        Box::pin(async move {
            match self.inbound.as_mut() {
                Some(rx) => rx.recv().await.unwrap_or(TransportEvent::Closed {
                    was_clean: false,
                    reason: Some("RawSocket reader stopped".into()),
                }),
                None => TransportEvent::Closed {
                    was_clean: false,
                    reason: Some("RawSocket not open".into()),
                },
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(self.shutdown())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RawSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    serializer: Serializer,
    max_len: usize,
    inbound: mpsc::Sender<TransportEvent>,
    writer: Writer,
    connected: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::with_max_len(max_len);
    let mut buf = vec![0u8; READ_BUFFER];

    let closed = 'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                break TransportEvent::Closed {
                    was_clean: true,
                    reason: None,
                }
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("RawSocket read error: {}", e);
                break TransportEvent::Closed {
                    was_clean: false,
                    reason: Some(e.to_string()),
                };
            }
        };

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("RawSocket framing error: {}", e);
                break TransportEvent::Closed {
                    was_clean: false,
                    reason: Some(e.to_string()),
                };
            }
        };

        for (kind, payload) in frames {
            match kind {
                FrameKind::Message => match serializer.decode(&payload) {
                    Ok(message) => {
                        if inbound.send(TransportEvent::Message(message)).await.is_err() {
                            tracing::debug!("session stopped reading");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!("undecodable RawSocket message: {}", e);
                        break 'read TransportEvent::Closed {
                            was_clean: false,
                            reason: Some(e.to_string()),
                        };
                    }
                },
                FrameKind::Ping => {
                    if let Ok(pong) = frame_encode(FrameKind::Pong, &payload) {
                        let _ = writer.lock().await.write_all(&pong).await;
                    }
                }
                FrameKind::Pong => tracing::trace!("RawSocket pong"),
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let _ = inbound.send(closed).await;
    tracing::debug!("RawSocket read loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use wamp_core::messages::Dict;

    /// Accept one connection, complete the handshake, and return the socket.
    async fn accept_handshake(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut hello = [0u8; 4];
        socket.read_exact(&mut hello).await.unwrap();
        assert_eq!(hello[0], 0x7F);
        // Echo the serializer, announce 2^16 byte messages.
        socket
            .write_all(&[0x7F, (7 << 4) | (hello[1] & 0x0F), 0, 0])
            .await
            .unwrap();
        socket
    }

    #[tokio::test]
    async fn exchanges_frames_with_router() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let router = tokio::spawn(async move {
            let mut socket = accept_handshake(&listener).await;

            // Ping first: the client must answer with a pong.
            socket
                .write_all(&frame_encode(FrameKind::Ping, b"hb").unwrap())
                .await
                .unwrap();
            let mut pong = [0u8; 6];
            socket.read_exact(&mut pong).await.unwrap();
            assert_eq!(pong, [2, 0, 0, 2, b'h', b'b']);

            let welcome = Serializer::Json
                .encode(&Message::Welcome {
                    session: 42,
                    details: Dict::new(),
                })
                .unwrap();
            socket
                .write_all(&frame_encode(FrameKind::Message, &welcome).unwrap())
                .await
                .unwrap();

            let mut header = [0u8; 4];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0);
            let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();
            Serializer::Json.decode(&body).unwrap()
        });

        let mut transport = RawSocketTransport::new(addr, Serializer::Json);
        transport.open().await.unwrap();
        assert!(transport.is_connected());

        match transport.recv().await {
            TransportEvent::Message(Message::Welcome { session, .. }) => assert_eq!(session, 42),
            other => panic!("unexpected event: {other:?}"),
        }

        let goodbye = Message::Goodbye {
            details: Dict::new(),
            reason: "wamp.close.normal".into(),
        };
        transport.send(goodbye.clone()).await.unwrap();
        assert_eq!(router.await.unwrap(), goodbye);

        // Router task dropped its socket.
        assert!(matches!(
            transport.recv().await,
            TransportEvent::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn rejected_handshake_fails_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 4];
            socket.read_exact(&mut hello).await.unwrap();
            // Error 1: serializer unsupported.
            socket.write_all(&[0x7F, 1 << 4, 0, 0]).await.unwrap();
        });

        let mut transport = RawSocketTransport::new(addr, Serializer::Cbor);
        let err = transport.open().await.unwrap_err();
        assert!(err.to_string().contains("serializer unsupported"));
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 4];
            socket.read_exact(&mut hello).await.unwrap();
            // Router accepts only 512-byte messages.
            socket.write_all(&[0x7F, hello[1] & 0x0F, 0, 0]).await.unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });

        let mut transport = RawSocketTransport::new(addr, Serializer::Json);
        transport.open().await.unwrap();
        let big = Message::Publish {
            request: 1,
            options: Dict::new(),
            topic: "com.example.big".into(),
            args: Some(vec![serde_json::Value::String("x".repeat(1024))]),
            kwargs: None,
        };
        assert!(transport.send(big).await.is_err());
    }

    #[tokio::test]
    async fn inbound_frame_over_announced_limit_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let router = tokio::spawn(async move {
            let mut socket = accept_handshake(&listener).await;
            let event = Serializer::Json
                .encode(&Message::Event {
                    subscription: 1,
                    publication: 2,
                    details: Dict::new(),
                    args: Some(vec![serde_json::Value::String("x".repeat(2048))]),
                    kwargs: None,
                })
                .unwrap();
            // One write, so the whole frame can arrive in a single read.
            socket
                .write_all(&frame_encode(FrameKind::Message, &event).unwrap())
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });

        // Announces 512-byte messages.
        let mut transport = RawSocketTransport::new(addr, Serializer::Json).with_max_len_exp(0);
        transport.open().await.unwrap();

        match transport.recv().await {
            TransportEvent::Closed { was_clean, reason } => {
                assert!(!was_clean);
                assert!(reason.unwrap().contains("exceeds limit of 512 bytes"));
            }
            other => panic!("oversized frame was delivered: {other:?}"),
        }
        assert!(!transport.is_connected());
        transport.close().await.unwrap();
        router.await.unwrap();
    }
}
