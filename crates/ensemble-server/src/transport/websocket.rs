//! WebSocket listener using tokio-tungstenite.
//!
//! The upgrade request carries the instance id in its path and the role,
//! admission session, and staff key in its query. An [`UpgradeGate`] inspects
//! that request before the handshake completes, so refused clients get a plain
//! HTTP status instead of a socket that is closed right away.

use ensemble_core::{is_valid_instance_id, EnsembleError, EnsembleResult, Role};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

/// Largest control text frame accepted from a client.
pub const MAX_TEXT_FRAME_SIZE: usize = 64 * 1024;

/// Largest binary frame accepted from a client; telemetry frames are far
/// smaller.
pub const MAX_BINARY_FRAME_SIZE: usize = 4 * 1024;

/// What a client asked for in its upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub instance_id: String,
    pub role: Option<Role>,
    pub session_id: Option<String>,
    pub key: Option<String>,
}

impl ConnectRequest {
    /// Parse `/ws/{instanceId}` or `/{instanceId}` plus the query string.
    pub fn parse(path: &str, query: Option<&str>) -> EnsembleResult<Self> {
        let rest = path
            .strip_prefix("/ws/")
            .or_else(|| path.strip_prefix('/'))
            .ok_or_else(|| EnsembleError::InvalidMessage(format!("bad path: {path}")))?;
        let instance_id = rest.strip_suffix('/').unwrap_or(rest);
        if !is_valid_instance_id(instance_id) {
            return Err(EnsembleError::InvalidMessage(format!(
                "bad instance id in path: {path}"
            )));
        }

        let mut req = Self {
            instance_id: instance_id.to_string(),
            role: None,
            session_id: None,
            key: None,
        };
        for (name, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match name.as_ref() {
                "role" => {
                    let role = value
                        .parse::<Role>()
                        .map_err(EnsembleError::InvalidMessage)?;
                    req.role = Some(role);
                }
                "session" if !value.is_empty() => req.session_id = Some(value.into_owned()),
                "key" if !value.is_empty() => req.key = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(req)
    }
}

/// Decides whether an upgrade request may proceed.
pub trait UpgradeGate: Send + Sync + 'static {
    /// Returns whether the client holds staff credentials, or the reason it
    /// was refused.
    fn admit(&self, request: &ConnectRequest) -> EnsembleResult<bool>;
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub request: ConnectRequest,
    pub staff: bool,
}

/// Accept WebSocket upgrades on `tcp_listener`.
///
/// Returns a receiver that yields accepted connections.
pub fn serve(
    tcp_listener: TcpListener,
    gate: Arc<dyn UpgradeGate>,
) -> mpsc::Receiver<WebSocketConnection> {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    tokio::spawn(async move {
                        let mut admitted: Option<(ConnectRequest, bool)> = None;
                        let callback = |req: &Request, resp: Response| {
                            check_upgrade(gate.as_ref(), req, resp, &mut admitted)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                let Some((request, staff)) = admitted else {
                                    return;
                                };
                                debug!(
                                    remote = %addr,
                                    instance_id = %request.instance_id,
                                    "WebSocket connection accepted"
                                );
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    request,
                                    staff,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    rx
}

fn check_upgrade(
    gate: &dyn UpgradeGate,
    req: &Request,
    resp: Response,
    admitted: &mut Option<(ConnectRequest, bool)>,
) -> Result<Response, ErrorResponse> {
    let outcome = ConnectRequest::parse(req.uri().path(), req.uri().query())
        .and_then(|request| gate.admit(&request).map(|staff| (request, staff)));
    match outcome {
        Ok(accepted) => {
            *admitted = Some(accepted);
            Ok(resp)
        }
        Err(e) => {
            warn!(path = %req.uri().path(), error = %e, "upgrade refused");
            let mut refusal = ErrorResponse::new(Some(e.to_string()));
            *refusal.status_mut() = upgrade_status(&e);
            Err(refusal)
        }
    }
}

/// HTTP status for a refused upgrade.
pub fn upgrade_status(err: &EnsembleError) -> StatusCode {
    match err {
        EnsembleError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        EnsembleError::AdmissionDenied(_) => StatusCode::FORBIDDEN,
        EnsembleError::UnauthorizedRole(_) => StatusCode::UNAUTHORIZED,
        EnsembleError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A data frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Receive the next data frame.
///
/// Returns `None` once the connection is closed. Pings are answered here.
pub async fn ws_recv(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> EnsembleResult<Option<Inbound>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_TEXT_FRAME_SIZE {
                    return Err(EnsembleError::InvalidMessage(format!(
                        "WS text frame too large: {} bytes (max {MAX_TEXT_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(Inbound::Text(text.as_str().to_string())));
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_BINARY_FRAME_SIZE {
                    return Err(EnsembleError::InvalidMessage(format!(
                        "WS binary frame too large: {} bytes (max {MAX_BINARY_FRAME_SIZE})",
                        data.len()
                    )));
                }
                return Ok(Some(Inbound::Binary(data.to_vec())));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(EnsembleError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

pub async fn ws_send_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    text: String,
) -> EnsembleResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| EnsembleError::Transport(format!("WS send failed: {e}")))
}

pub async fn ws_send_binary(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    data: Vec<u8>,
) -> EnsembleResult<()> {
    ws.send(Message::Binary(data.into()))
        .await
        .map_err(|e| EnsembleError::Transport(format!("WS send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ws_prefixed_path() {
        let req = ConnectRequest::parse("/ws/room-1", Some("role=stage&key=s3cret")).unwrap();
        assert_eq!(req.instance_id, "room-1");
        assert_eq!(req.role, Some(Role::Aggregator));
        assert_eq!(req.key.as_deref(), Some("s3cret"));
        assert_eq!(req.session_id, None);
    }

    #[test]
    fn parse_bare_path() {
        let req = ConnectRequest::parse("/abc123/", Some("role=musician&session=s%201")).unwrap();
        assert_eq!(req.instance_id, "abc123");
        assert_eq!(req.role, Some(Role::Producer));
        assert_eq!(req.session_id.as_deref(), Some("s 1"));
    }

    #[test]
    fn parse_without_query() {
        let req = ConnectRequest::parse("/X", None).unwrap();
        assert_eq!(req.instance_id, "X");
        assert_eq!(req.role, None);
        assert_eq!(req.key, None);
    }

    #[test]
    fn parse_rejects_malformed() {
        for path in ["/", "/ws/", "/a/b", "/ws/a b", ""] {
            assert!(
                matches!(ConnectRequest::parse(path, None), Err(EnsembleError::InvalidMessage(_))),
                "{path}"
            );
        }
        assert!(ConnectRequest::parse("/X", Some("role=drummer")).is_err());
    }

    #[test]
    fn refusal_statuses() {
        assert_eq!(
            upgrade_status(&EnsembleError::UnknownInstance("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            upgrade_status(&EnsembleError::AdmissionDenied("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            upgrade_status(&EnsembleError::UnauthorizedRole("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            upgrade_status(&EnsembleError::InvalidMessage("x".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
