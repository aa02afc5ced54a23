//! Core server: accepts connections and drives each one through the relay.
//!
//! Owns the relay router, the admission service, and the rate limiters.
//! Runs the WebSocket listener, the HTTP API, the idle reaper, and the
//! admission maintenance tick.

use crate::api::{self, ApiState};
use crate::auth::{AdmissionService, ServerRateLimits, SharedSecret};
use crate::config::ServerConfig;
use crate::relay::{reaper, Connection, InstanceRegistry, Outbound, RelayRouter};
use crate::state::{lock, SharedAdmission, SharedRelay};
use crate::transport::websocket::{self, ConnectRequest, Inbound, UpgradeGate, WebSocketConnection};
use ensemble_core::{EnsembleError, EnsembleResult, Role};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Admits upgrades for known instances and checks the requested role.
///
/// A client that names no role and holds no staff key can only ever become a
/// producer, so it must already be admitted.
struct RelayGate {
    relay: SharedRelay,
    secret: Option<SharedSecret>,
}

impl UpgradeGate for RelayGate {
    fn admit(&self, request: &ConnectRequest) -> EnsembleResult<bool> {
        let staff = match (&self.secret, &request.key) {
            (None, _) => true,
            (Some(secret), Some(key)) => secret.verify(key),
            (Some(_), None) => false,
        };
        let relay = lock(&self.relay);
        if !relay.registry().contains(&request.instance_id) {
            return Err(EnsembleError::UnknownInstance(request.instance_id.clone()));
        }
        match (request.role, staff) {
            (Some(role), _) => relay.authorize(role, request.session_id.as_deref(), staff)?,
            (None, false) => relay.authorize(Role::Producer, request.session_id.as_deref(), false)?,
            (None, true) => {}
        }
        Ok(staff)
    }
}

/// The ensemble relay server.
pub struct EnsembleServer {
    config: ServerConfig,
    relay: SharedRelay,
    admission: SharedAdmission,
    rate_limits: Arc<tokio::sync::Mutex<ServerRateLimits>>,
}

impl EnsembleServer {
    pub fn new(config: ServerConfig) -> Self {
        let admission: SharedAdmission =
            Arc::new(Mutex::new(AdmissionService::new(config.admission)));
        let mut router = RelayRouter::new(
            InstanceRegistry::new(config.aggregator_policy),
            config.telemetry_schema,
        );
        if config.require_approval {
            router = router.with_admission(admission.clone());
        }
        let rate_limits = Arc::new(tokio::sync::Mutex::new(ServerRateLimits::new(
            config.approve_attempts_per_minute,
            config.create_attempts_per_minute,
        )));

        Self {
            config,
            relay: Arc::new(Mutex::new(router)),
            admission,
            rate_limits,
        }
    }

    pub fn relay(&self) -> &SharedRelay {
        &self.relay
    }

    pub fn admission(&self) -> &SharedAdmission {
        &self.admission
    }

    /// Bind both listeners from the config and serve until they close.
    pub async fn run(self) -> EnsembleResult<()> {
        let ws_addr = SocketAddr::new(self.config.bind, self.config.port);
        let http_addr = SocketAddr::new(self.config.bind, self.config.http_port);

        let ws_listener = TcpListener::bind(ws_addr)
            .await
            .map_err(|e| EnsembleError::Transport(format!("WS bind failed on {ws_addr}: {e}")))?;
        let http_listener = TcpListener::bind(http_addr)
            .await
            .map_err(|e| EnsembleError::Transport(format!("HTTP bind failed on {http_addr}: {e}")))?;

        Arc::new(self).serve(ws_listener, http_listener).await
    }

    /// Serve on already bound listeners.
    pub async fn serve(
        self: Arc<Self>,
        ws_listener: TcpListener,
        http_listener: TcpListener,
    ) -> EnsembleResult<()> {
        let ws_addr = ws_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        // HTTP API
        let app = api::router(ApiState {
            relay: self.relay.clone(),
            admission: self.admission.clone(),
            rate_limits: self.rate_limits.clone(),
            secret: self.config.shared_secret.clone(),
        });
        tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(http_listener, service).await {
                error!(error = %e, "HTTP server failed");
            }
        });

        reaper::spawn(
            self.relay.clone(),
            self.config.reap_interval,
            self.config.stale_after,
        );
        self.spawn_admission_maintenance();

        let gate = Arc::new(RelayGate {
            relay: self.relay.clone(),
            secret: self.config.shared_secret.clone(),
        });
        let mut ws_rx = websocket::serve(ws_listener, gate);

        info!(
            ws = %ws_addr,
            http = %http_addr,
            schema = %self.config.telemetry_schema,
            policy = %self.config.aggregator_policy,
            approval = self.config.require_approval,
            "ensemble-server ready"
        );

        while let Some(ws_conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_websocket(ws_conn).await {
                    warn!(error = %e, "WebSocket connection error");
                }
            });
        }

        info!("WebSocket listener closed, shutting down");
        Ok(())
    }

    /// Rotate admission tokens, purge old pending sessions, and prune the
    /// rate limiter on every rotation tick.
    fn spawn_admission_maintenance(&self) {
        let admission = self.admission.clone();
        let rate_limits = self.rate_limits.clone();
        let period = self.config.rotate_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;

                let purged = lock(&admission).purge_expired(Instant::now());
                let rotation = lock(&admission).rotate_tokens();
                match rotation {
                    Ok(rotated) => {
                        debug!(rotated, purged = purged.len(), "admission tokens rotated")
                    }
                    Err(e) => warn!(error = %e, "admission token rotation skipped"),
                }

                rate_limits.lock().await.gc();
            }
        });
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) -> EnsembleResult<()> {
        let WebSocketConnection {
            mut ws_stream,
            remote_addr,
            request,
            staff,
        } = conn;

        let (connection, outbound_rx) = Connection::new(
            request.instance_id.clone(),
            request.session_id.clone(),
            staff,
            self.config.outbound_queue,
        );
        info!(
            remote = %remote_addr,
            connection_id = %connection.id(),
            instance_id = %request.instance_id,
            "connection opened"
        );

        if let Some(role) = request.role {
            let claimed = lock(&self.relay).identify(&connection, role);
            if let Err(e) = claimed {
                let _ = ws_stream.close(None).await;
                return Err(e);
            }
        }

        let result = self
            .session_loop(&mut ws_stream, &connection, outbound_rx)
            .await;

        lock(&self.relay).disconnect(&connection);
        let _ = ws_stream.close(None).await;
        info!(connection_id = %connection.id(), "connection closed");
        result
    }

    async fn session_loop(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        connection: &Connection,
        mut outbound_rx: mpsc::Receiver<Outbound>,
    ) -> EnsembleResult<()> {
        loop {
            tokio::select! {
                _ = connection.close_requested() => {
                    debug!(connection_id = %connection.id(), "closing on request");
                    break;
                }

                Some(frame) = outbound_rx.recv() => {
                    match frame {
                        Outbound::Text(text) => websocket::ws_send_text(ws, text).await?,
                        Outbound::Binary(data) => websocket::ws_send_binary(ws, data).await?,
                    }
                }

                inbound = websocket::ws_recv(ws) => {
                    match inbound {
                        Ok(Some(Inbound::Text(text))) => {
                            let handled = lock(&self.relay).handle_text(connection, &text);
                            if let Err(e) = handled {
                                warn!(connection_id = %connection.id(), error = %e, "control message rejected");
                                if e.closes_connection() {
                                    break;
                                }
                            }
                        }
                        Ok(Some(Inbound::Binary(data))) => {
                            let forwarded = lock(&self.relay).handle_binary(connection, &data);
                            if let Err(e) = forwarded {
                                debug!(connection_id = %connection.id(), error = %e, "telemetry frame dropped");
                            }
                        }
                        Ok(None) => {
                            debug!(connection_id = %connection.id(), "peer closed");
                            break;
                        }
                        Err(e) => {
                            debug!(connection_id = %connection.id(), error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::config::ConfigFile;
    use ensemble_core::codec::MotionSample;
    use ensemble_core::{decode_forwarded, ControlMessage, TelemetrySchema};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(overrides: ConfigOverrides) -> (Arc<EnsembleServer>, SocketAddr) {
        let config = ServerConfig::from_file(ConfigFile::default(), overrides);
        let server = Arc::new(EnsembleServer::new(config));
        let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ws.local_addr().unwrap();
        tokio::spawn(server.clone().serve(ws, http));
        (server, addr)
    }

    async fn next_message(client: &mut Client) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                return msg;
            }
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn refusal_status(err: WsError) -> u16 {
        match err {
            WsError::Http(resp) => resp.status().as_u16(),
            other => panic!("expected HTTP refusal, got {other}"),
        }
    }

    #[tokio::test]
    async fn telemetry_flows_over_sockets() {
        let (server, addr) = start(ConfigOverrides {
            no_approval: true,
            ..ConfigOverrides::default()
        })
        .await;
        lock(server.relay()).registry_mut().create_instance("X");

        let (mut producer, _) = connect_async(format!("ws://{addr}/ws/X?role=musician"))
            .await
            .unwrap();
        wait_for(|| {
            lock(server.relay())
                .registry()
                .get("X")
                .is_some_and(|i| i.producer_count() == 1)
        })
        .await;

        let (mut stage, _) = connect_async(format!("ws://{addr}/ws/X?role=stage"))
            .await
            .unwrap();
        let producer_id = match next_message(&mut stage).await {
            Message::Text(text) => match ControlMessage::parse(text.as_str()).unwrap() {
                Some(ControlMessage::MusicianList { musicians }) => {
                    assert_eq!(musicians.len(), 1);
                    musicians[0].clone()
                }
                other => panic!("expected musician-list, got {other:?}"),
            },
            other => panic!("expected text frame, got {other:?}"),
        };

        let mut payload = vec![0u8; 37];
        payload[0] = 0x01;
        producer
            .send(Message::Binary(payload.clone().into()))
            .await
            .unwrap();

        let frame = match next_message(&mut stage).await {
            Message::Binary(data) => data.to_vec(),
            other => panic!("expected binary frame, got {other:?}"),
        };
        assert_eq!(frame.len(), 73);
        assert_eq!(&frame[..36], producer_id.as_bytes());
        assert_eq!(&frame[36..], &payload[..]);
        match decode_forwarded(TelemetrySchema::V1, &frame).unwrap().1 {
            MotionSample::V1(sample) => assert!(sample.flags.tracking),
            other => panic!("unexpected sample {other:?}"),
        }

        producer.close(None).await.unwrap();
        match next_message(&mut stage).await {
            Message::Text(text) => match ControlMessage::parse(text.as_str()).unwrap() {
                Some(ControlMessage::Disconnect { id, count, .. }) => {
                    assert_eq!(id, producer_id);
                    assert_eq!(count, 0);
                }
                other => panic!("expected disconnect, got {other:?}"),
            },
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identify_after_upgrade() {
        let (server, addr) = start(ConfigOverrides {
            no_approval: true,
            ..ConfigOverrides::default()
        })
        .await;
        lock(server.relay()).registry_mut().create_instance("room");

        let (mut stage, _) = connect_async(format!("ws://{addr}/room")).await.unwrap();
        stage
            .send(Message::Text(r#"{"type":"identify","role":"aggregator"}"#.to_string().into()))
            .await
            .unwrap();
        match next_message(&mut stage).await {
            Message::Text(text) => assert_eq!(
                ControlMessage::parse(text.as_str()).unwrap(),
                Some(ControlMessage::MusicianList { musicians: vec![] })
            ),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upgrades_are_gated() {
        let (server, addr) = start(ConfigOverrides {
            shared_secret: Some("s3cret".into()),
            ..ConfigOverrides::default()
        })
        .await;
        lock(server.relay()).registry_mut().create_instance("X");

        let err = connect_async(format!("ws://{addr}/ws/missing")).await.unwrap_err();
        assert_eq!(refusal_status(err), 404);

        let err = connect_async(format!("ws://{addr}/ws/X?role=producer&session=s1"))
            .await
            .unwrap_err();
        assert_eq!(refusal_status(err), 403);

        let err = connect_async(format!("ws://{addr}/ws/X?role=aggregator&key=wrong"))
            .await
            .unwrap_err();
        assert_eq!(refusal_status(err), 401);

        let err = connect_async(format!("ws://{addr}/ws/a/b")).await.unwrap_err();
        assert_eq!(refusal_status(err), 400);

        connect_async(format!("ws://{addr}/ws/X?role=aggregator&key=s3cret"))
            .await
            .unwrap();

        lock(server.admission()).create_pending_session("s1").unwrap();
        lock(server.admission()).approve_session("s1").unwrap();
        connect_async(format!("ws://{addr}/ws/X?role=producer&session=s1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn roleless_upgrade_needs_admission_or_staff_key() {
        let (server, addr) = start(ConfigOverrides {
            shared_secret: Some("s3cret".into()),
            ..ConfigOverrides::default()
        })
        .await;
        lock(server.relay()).registry_mut().create_instance("X");

        let err = connect_async(format!("ws://{addr}/ws/X")).await.unwrap_err();
        assert_eq!(refusal_status(err), 403);

        lock(server.admission()).create_pending_session("s2").unwrap();
        let err = connect_async(format!("ws://{addr}/ws/X?session=s2")).await.unwrap_err();
        assert_eq!(refusal_status(err), 403);

        connect_async(format!("ws://{addr}/ws/X?key=s3cret")).await.unwrap();

        lock(server.admission()).approve_session("s2").unwrap();
        connect_async(format!("ws://{addr}/ws/X?session=s2")).await.unwrap();
    }

    #[tokio::test]
    async fn replaced_aggregator_is_closed() {
        let (server, addr) = start(ConfigOverrides {
            no_approval: true,
            ..ConfigOverrides::default()
        })
        .await;
        lock(server.relay()).registry_mut().create_instance("X");

        let (mut first, _) = connect_async(format!("ws://{addr}/ws/X?role=stage")).await.unwrap();
        next_message(&mut first).await;
        let (mut second, _) = connect_async(format!("ws://{addr}/ws/X?role=stage")).await.unwrap();
        next_message(&mut second).await;

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
