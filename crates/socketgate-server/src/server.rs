//! Core server: accepts connections and runs a session for each one.
//!
//! Owns the shared session services and the control-plane endpoint, and
//! coordinates shutdown of both listeners and every live session.

use crate::auth::CookieAuthenticator;
use crate::config::ServerConfig;
use crate::control;
use crate::relay::Registry;
use crate::rpc::{HttpBrokerClient, HttpPresenceClient};
use crate::session::{Session, SessionServices};
use crate::transport::websocket::{self, WebSocketConnection};
use socketgate_core::pipeline::{chain, RecoveryFilter, StatsFilter};
use socketgate_core::{GatewayError, GatewayResult, StatsReceiver};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long live sessions get to wind down after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound sockets, ready to serve.
pub struct Listeners {
    pub ws_addr: SocketAddr,
    pub control_addr: SocketAddr,
    connections: mpsc::Receiver<WebSocketConnection>,
    control: TcpListener,
}

/// The gateway instance.
pub struct Gateway {
    ws_addr: SocketAddr,
    control_addr: SocketAddr,
    registry: Registry,
    stats: Arc<dyn StatsReceiver>,
    services: Arc<SessionServices>,
}

impl Gateway {
    pub fn new(
        config: &ServerConfig,
        registry: Registry,
        stats: Arc<dyn StatsReceiver>,
        shutdown: CancellationToken,
    ) -> GatewayResult<Self> {
        let presence = HttpPresenceClient::new(&config.presence_url, config.presence_timeout)?;
        let broker = HttpBrokerClient::new(&config.broker_url, config.broker_timeout)?;

        let services = Arc::new(SessionServices {
            registry: registry.clone(),
            authenticator: Arc::new(CookieAuthenticator::new(config.auth_cookie.clone())),
            presence: Arc::new(presence),
            broker: Arc::new(broker),
            outbound: chain(vec![
                Arc::new(StatsFilter::new(stats.clone())),
                Arc::new(RecoveryFilter),
            ]),
            delivery_capacity: config.delivery_capacity,
            shutdown,
        });

        Ok(Self {
            ws_addr: config.ws_addr,
            control_addr: config.control_addr,
            registry,
            stats,
            services,
        })
    }

    /// Bind the WebSocket and control listeners.
    pub async fn bind(&self) -> GatewayResult<Listeners> {
        let (ws_addr, connections) =
            websocket::start_listener(self.ws_addr, self.services.shutdown.clone()).await?;

        let control = TcpListener::bind(self.control_addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("control bind failed: {e}")))?;
        let control_addr = control.local_addr()?;
        info!(addr = %control_addr, "control endpoint started");

        Ok(Listeners {
            ws_addr,
            control_addr,
            connections,
            control,
        })
    }

    /// Serve until shutdown, then give live sessions time to terminate.
    pub async fn serve(self, listeners: Listeners) -> GatewayResult<()> {
        let shutdown = self.services.shutdown.clone();
        let Listeners {
            mut connections,
            control,
            ..
        } = listeners;

        let app = control::router(self.registry.clone(), self.stats.clone());
        let control_shutdown = shutdown.clone();
        let control_task = tokio::spawn(async move {
            axum::serve(control, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { control_shutdown.cancelled().await })
                .await
        });

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                conn = connections.recv() => match conn {
                    Some(conn) => self.accept(&mut sessions, conn),
                    None => break,
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "session task failed");
                    }
                }
            }
        }

        info!(sessions = sessions.len(), "draining sessions");
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "sessions did not finish in time");
            sessions.abort_all();
        }

        match control_task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Io(e)),
            Err(e) => Err(GatewayError::Other(format!("control endpoint task failed: {e}"))),
        }
    }

    fn accept(&self, sessions: &mut JoinSet<()>, conn: WebSocketConnection) {
        let remote = conn.remote_addr;
        let (handshake, source, sink) = conn.into_parts();
        let session = Session::new(self.services.clone(), handshake, source, sink);
        debug!(remote = %remote, "session started");
        sessions.spawn(async move {
            session.run().await;
            debug!(remote = %remote, "session ended");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use socketgate_core::StatsRecorder;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(presence: &MockServer, broker: &MockServer) -> ServerConfig {
        ServerConfig {
            ws_addr: "127.0.0.1:0".parse().unwrap(),
            control_addr: "127.0.0.1:0".parse().unwrap(),
            delivery_capacity: 16,
            auth_cookie: "auth".into(),
            presence_url: presence.uri(),
            presence_timeout: Duration::from_secs(2),
            broker_url: broker.uri(),
            broker_timeout: Duration::from_secs(2),
            report_interval: None,
        }
    }

    async fn presence_puts(server: &MockServer) -> Vec<Request> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "PUT")
            .collect()
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(WAIT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition met in time");
    }

    #[tokio::test]
    async fn relays_between_client_broker_and_control_plane() {
        let presence = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/status/websocket/[0-9a-f]+$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&presence)
            .await;
        let broker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/route"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&broker)
            .await;

        let (registry, event_loop) = Registry::new();
        tokio::spawn(event_loop.run());
        let stats = StatsRecorder::new();
        let shutdown = CancellationToken::new();
        let gateway = Gateway::new(
            &test_config(&presence, &broker),
            registry.clone(),
            Arc::new(stats.clone()),
            shutdown.clone(),
        )
        .unwrap();
        let listeners = gateway.bind().await.unwrap();
        let (ws_addr, control_addr) = (listeners.ws_addr, listeners.control_addr);
        let server = tokio::spawn(gateway.serve(listeners));

        // Client connects with its session cookie.
        let mut request = format!("ws://{ws_addr}/").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("cookie", HeaderValue::from_static("auth=user1"));
        let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        // Presence learns the connection id.
        wait_for(|| async { !presence_puts(&presence).await.is_empty() }).await;
        let online = presence_puts(&presence).await.remove(0);
        let body: serde_json::Value = serde_json::from_slice(&online.body).unwrap();
        assert_eq!(body["user_id"], "user1");
        assert_eq!(body["status"], "online");
        let id = online.url.path().rsplit('/').next().unwrap().to_string();

        // Client to broker.
        client.send(Message::Binary(b"abc".to_vec().into())).await.unwrap();
        wait_for(|| async {
            broker
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .any(|r| r.body == b"abc")
        })
        .await;

        // Control plane to client.
        let response = reqwest::Client::new()
            .post(format!("http://{control_addr}/websocket/{id}/send"))
            .body("xyz")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        match timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], b"xyz"),
            other => panic!("unexpected message {other:?}"),
        }

        // Disconnect: presence goes offline and the id is released.
        client.close(None).await.unwrap();
        wait_for(|| async { presence_puts(&presence).await.len() == 2 }).await;
        let offline: serde_json::Value =
            serde_json::from_slice(&presence_puts(&presence).await[1].body).unwrap();
        assert_eq!(offline["status"], "offline");
        wait_for(|| async { registry.len().await.unwrap() == 0 }).await;

        shutdown.cancel();
        timeout(WAIT, server).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.counter_value("broker.route.success"), 1);
    }

    #[tokio::test]
    async fn unauthenticated_client_is_dropped() {
        let presence = MockServer::start().await;
        let broker = MockServer::start().await;
        let (registry, event_loop) = Registry::new();
        tokio::spawn(event_loop.run());
        let shutdown = CancellationToken::new();
        let gateway = Gateway::new(
            &test_config(&presence, &broker),
            registry.clone(),
            Arc::new(StatsRecorder::new()),
            shutdown.clone(),
        )
        .unwrap();
        let listeners = gateway.bind().await.unwrap();
        let ws_addr = listeners.ws_addr;
        let server = tokio::spawn(gateway.serve(listeners));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{ws_addr}/"))
            .await
            .unwrap();
        // The server closes the connection without registering it.
        let next = timeout(WAIT, client.next()).await.unwrap();
        assert!(!matches!(next, Some(Ok(Message::Binary(_)))));
        assert_eq!(registry.len().await.unwrap(), 0);
        assert!(presence_puts(&presence).await.is_empty());

        shutdown.cancel();
        timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    }
}
