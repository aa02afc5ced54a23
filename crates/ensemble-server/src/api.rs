//! HTTP surface for rooms and admission, served with axum.
//!
//! Staff endpoints expect `Authorization: Bearer <secret>` whenever a shared
//! secret is configured.

use crate::auth::{ServerRateLimits, SharedSecret};
use crate::relay::InstanceSummary;
use crate::state::{lock, SharedAdmission, SharedRelay};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use ensemble_core::{generate_code, is_valid_instance_id, ConnectionId, EnsembleError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Length of server-generated instance ids.
const INSTANCE_ID_LEN: usize = 8;

#[derive(Clone)]
pub struct ApiState {
    pub relay: SharedRelay,
    pub admission: SharedAdmission,
    pub rate_limits: Arc<tokio::sync::Mutex<ServerRateLimits>>,
    pub secret: Option<SharedSecret>,
}

impl ApiState {
    fn require_staff(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let header = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if secret.verify_bearer(header) {
            Ok(())
        } else {
            Err(EnsembleError::UnauthorizedRole("staff credentials required".into()).into())
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/instance/new", post(new_instance))
        .route("/api/instance/:id", put(put_instance).delete(delete_instance))
        .route("/api/instances", get(list_instances))
        .route("/api/admission/sessions", post(create_session))
        .route(
            "/api/admission/sessions/:id",
            get(session_status).delete(revoke_session),
        )
        .route("/api/admission/approve", post(approve))
        .with_state(state)
}

/// Errors returned to HTTP clients as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Relay(EnsembleError),
    RateLimited,
}

impl From<EnsembleError> for ApiError {
    fn from(e: EnsembleError) -> Self {
        ApiError::Relay(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "too many attempts, slow down".to_string(),
            ),
            ApiError::Relay(e) => {
                let status = match &e {
                    EnsembleError::StaleToken
                    | EnsembleError::UnknownInstance(_)
                    | EnsembleError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    EnsembleError::AlreadyApproved(_) => StatusCode::CONFLICT,
                    EnsembleError::UnauthorizedRole(_) => StatusCode::UNAUTHORIZED,
                    EnsembleError::AdmissionDenied(_) => StatusCode::FORBIDDEN,
                    EnsembleError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
                    EnsembleError::TokenSpaceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    instances: usize,
    pending_sessions: usize,
    approved_sessions: usize,
}

async fn health(State(state): State<ApiState>) -> Json<Health> {
    let instances = lock(&state.relay).registry().len();
    let (pending_sessions, approved_sessions) = {
        let admission = lock(&state.admission);
        (admission.pending_count(), admission.approved_count())
    };
    Json(Health {
        status: "ok",
        instances,
        pending_sessions,
        approved_sessions,
    })
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCreated {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
}

async fn new_instance(State(state): State<ApiState>) -> Json<InstanceCreated> {
    let mut relay = lock(&state.relay);
    let registry = relay.registry_mut();
    let instance_id = loop {
        let id = generate_code(INSTANCE_ID_LEN);
        if registry.create_instance(&id) {
            break id;
        }
    };
    info!(instance_id = %instance_id, "instance created");
    Json(InstanceCreated {
        instance_id,
        created: None,
    })
}

async fn put_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceCreated>, ApiError> {
    if !is_valid_instance_id(&id) {
        return Err(EnsembleError::InvalidMessage(format!("invalid instance id: {id}")).into());
    }
    let created = lock(&state.relay).registry_mut().create_instance(&id);
    if created {
        info!(instance_id = %id, "instance created");
    }
    Ok(Json(InstanceCreated {
        instance_id: id,
        created: Some(created),
    }))
}

async fn list_instances(State(state): State<ApiState>) -> Json<Vec<InstanceSummary>> {
    Json(lock(&state.relay).registry().summaries(Instant::now()))
}

async fn delete_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.require_staff(&headers)?;
    if lock(&state.relay).registry_mut().remove_instance(&id) {
        info!(instance_id = %id, "instance removed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(EnsembleError::UnknownInstance(id).into())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub session_id: String,
    pub token: String,
}

async fn create_session(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<SessionToken>, ApiError> {
    let allowed = state.rate_limits.lock().await.check_create(&remote.ip());
    if !allowed {
        warn!(remote = %remote, "session creation rate limited");
        return Err(ApiError::RateLimited);
    }
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let session_id = match request.session_id {
        Some(id) if is_valid_instance_id(&id) => id,
        Some(id) => {
            return Err(EnsembleError::InvalidMessage(format!("invalid session id: {id}")).into())
        }
        None => ConnectionId::generate().to_string(),
    };
    let token = lock(&state.admission).create_pending_session(&session_id)?;
    Ok(Json(SessionToken { session_id, token }))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

async fn session_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let admission = lock(&state.admission);
    let approved = admission.is_session_approved(&id);
    let token = admission.pending_token(&id).map(str::to_string);
    if !approved && token.is_none() {
        return Err(EnsembleError::SessionNotFound(id).into());
    }
    Ok(Json(SessionStatus {
        session_id: id,
        approved,
        token,
    }))
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approved {
    pub session_id: String,
}

async fn approve(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<Approved>, ApiError> {
    let allowed = state.rate_limits.lock().await.check_approve(&remote.ip());
    if !allowed {
        warn!(remote = %remote, "approval rate limited");
        return Err(ApiError::RateLimited);
    }
    state.require_staff(&headers)?;

    let session_id = lock(&state.admission).approve_by_token(&request.token)?;
    Ok(Json(Approved { session_id }))
}

async fn revoke_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.require_staff(&headers)?;
    if lock(&state.admission).revoke_session(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(EnsembleError::SessionNotFound(id).into())
    }
}
