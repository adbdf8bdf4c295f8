//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the upgrade while capturing the
//! handshake request for authentication, and hands each connection to the
//! gateway as a [`WebSocketConnection`].

use crate::auth::HandshakeRequest;
use crate::pump::{MessageSink, MessageSource};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use socketgate_core::{GatewayError, GatewayResult};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum accepted client message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// How long a TCP peer gets to complete the upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An upgraded client connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub handshake: HandshakeRequest,
    pub remote_addr: SocketAddr,
}

impl WebSocketConnection {
    /// Split into the pieces the lifecycle drives.
    pub fn into_parts(self) -> (HandshakeRequest, WsSource, WsSink) {
        let (sink, stream) = self.ws_stream.split();
        (self.handshake, WsSource(stream), WsSink(sink))
    }
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields upgraded connections. The accept loop
/// stops when `shutdown` fires.
pub async fn start_listener(
    bind_addr: SocketAddr,
    shutdown: CancellationToken,
) -> GatewayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let upgraded = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            upgraded = upgrade(stream, HANDSHAKE_TIMEOUT) => upgraded,
                        };
                        match upgraded {
                            Ok((ws_stream, handshake)) => {
                                debug!(remote = %addr, path = %handshake.path, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    handshake,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
    limit: Duration,
) -> GatewayResult<(WebSocketStream<TcpStream>, HandshakeRequest)> {
    let mut captured = HandshakeRequest::default();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        captured = capture(req);
        Ok(resp)
    };
    let ws_stream = tokio::time::timeout(limit, tokio_tungstenite::accept_hdr_async(stream, callback))
        .await
        .map_err(|_| GatewayError::Transport("WS handshake timed out".into()))?
        .map_err(|e| GatewayError::Transport(format!("WS upgrade failed: {e}")))?;
    Ok((ws_stream, captured))
}

fn capture(req: &Request) -> HandshakeRequest {
    HandshakeRequest {
        path: req.uri().path().to_string(),
        headers: req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    }
}

/// Incoming half of an upgraded connection.
pub struct WsSource(SplitStream<WebSocketStream<TcpStream>>);

impl MessageSource for WsSource {
    /// Binary messages only; text frames are skipped and control frames
    /// are answered by tungstenite.
    fn read_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                match self.0.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > MAX_WS_FRAME_SIZE {
                            return Err(GatewayError::InvalidMessage(format!(
                                "WS frame too large: {} bytes (max {})",
                                data.len(),
                                MAX_WS_FRAME_SIZE
                            )));
                        }
                        return Ok(Some(data.into()));
                    }
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(GatewayError::Transport(format!("WS recv failed: {e}")));
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}

/// Outgoing half of an upgraded connection.
pub struct WsSink(SplitSink<WebSocketStream<TcpStream>, Message>);

impl MessageSink for WsSink {
    fn write_message<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.0
                .send(Message::Binary(payload.to_vec().into()))
                .await
                .map_err(|e| GatewayError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.0
                .close()
                .await
                .map_err(|e| GatewayError::Transport(format!("WS close failed: {e}")))
        })
    }
}
