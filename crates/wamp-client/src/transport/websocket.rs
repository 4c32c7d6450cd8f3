//! WebSocket transport.
//!
//! The serializer is negotiated through `Sec-WebSocket-Protocol`
//! (`wamp.2.json` or `wamp.2.cbor`). JSON travels in text frames, CBOR in
//! binary frames. A reader task decodes inbound frames and the session
//! pulls decoded messages from its channel. Pings are answered by
//! tungstenite while the reader polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wamp_core::codec::Serializer;
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::Message;
use wamp_core::transport::{Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

const INBOUND_CAPACITY: usize = 256;

/// WAMP over WebSocket.
pub struct WebSocketTransport {
    url: String,
    serializer: Serializer,
    sink: Option<WsSink>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, serializer: Serializer) -> Self {
        Self {
            url: url.into(),
            serializer,
            sink: None,
            inbound: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    async fn connect(&mut self) -> WampResult<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| WampError::Transport(format!("invalid WebSocket URL {}: {e}", self.url)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(self.serializer.subprotocol()),
        );

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| WampError::Transport(format!("WebSocket connect error: {e}")))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok());
        match negotiated {
            Some(name) if Serializer::from_subprotocol(name) == Some(self.serializer) => {}
            Some(name) => {
                return Err(WampError::Transport(format!(
                    "router negotiated unexpected subprotocol {name}"
                )));
            }
            None => {
                return Err(WampError::Transport(
                    "router did not accept a WAMP subprotocol".into(),
                ));
            }
        }

        tracing::info!("WebSocket connected to {} ({})", self.url, self.serializer.subprotocol());

        let (ws_sink, ws_read) = ws_stream.split();
        let ws_sink = Arc::new(Mutex::new(ws_sink));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        self.connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(
            ws_read,
            self.serializer,
            inbound_tx,
            self.connected.clone(),
        ));

        self.sink = Some(ws_sink);
        self.inbound = Some(inbound_rx);
        self.reader = Some(reader);
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> WampResult<()> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| WampError::Transport("WebSocket not open".into()))?;

        let bytes = self.serializer.encode(&message)?;
        let frame = if self.serializer.is_binary() {
            WsMessage::Binary(bytes)
        } else {
            let text = String::from_utf8(bytes)
                .map_err(|e| WampError::Codec(format!("JSON output is not UTF-8: {e}")))?;
            WsMessage::Text(text)
        };

        sink.lock()
            .await
            .send(frame)
            .await
            .map_err(|e| WampError::Transport(format!("WebSocket send error: {e}")))
    }

    async fn shutdown(&mut self) -> WampResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sink) = self.sink.take() {
            let mut sink = sink.lock().await;
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound = None;
        Ok(())
    }
}

impl Transport for WebSocketTransport {
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
                    reason: Some("WebSocket reader stopped".into()),
                }),
                None => TransportEvent::Closed {
                    was_clean: false,
                    reason: Some("WebSocket not open".into()),
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

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Decode inbound frames until the socket ends, then report how it ended.
async fn read_loop(
    mut ws_read: SplitStream<WsStream>,
    serializer: Serializer,
    inbound: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let closed = loop {
        let data = match ws_read.next().await {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            // tungstenite queues the pong itself.
            Some(Ok(WsMessage::Ping(_))) => continue,
            Some(Ok(WsMessage::Close(frame))) => {
                tracing::debug!("WebSocket close frame received");
                break TransportEvent::Closed {
                    was_clean: true,
                    reason: frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::error!("WebSocket read error: {}", e);
                break TransportEvent::Closed {
                    was_clean: false,
                    reason: Some(e.to_string()),
                };
            }
            None => {
                break TransportEvent::Closed {
                    was_clean: false,
                    reason: None,
                }
            }
        };

        match serializer.decode(&data) {
            Ok(message) => {
                if inbound.send(TransportEvent::Message(message)).await.is_err() {
                    tracing::debug!("session stopped reading");
                    return;
                }
            }
            Err(e) => {
                tracing::error!("undecodable WebSocket message: {}", e);
                break TransportEvent::Closed {
                    was_clean: false,
                    reason: Some(e.to_string()),
                };
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let _ = inbound.send(closed).await;
    tracing::debug!("WebSocket read loop ended");
}
