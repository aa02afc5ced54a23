use thiserror::Error;

/// Malformed telemetry frames. A frame that fails any of these checks is
/// rejected whole; nothing is parsed out of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("invalid sender identity prefix")]
    Identity,
}

/// Errors produced by the ensemble relay.
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unauthorized role: {0}")]
    UnauthorizedRole(String),

    #[error("role already assigned: {0}")]
    RoleConflict(String),

    #[error("unknown producer: {0}")]
    UnknownProducer(String),

    #[error("stale or unknown token")]
    StaleToken,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already approved: {0}")]
    AlreadyApproved(String),

    #[error("no free admission token after {0} attempts")]
    TokenSpaceExhausted(usize),

    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnsembleError {
    /// Whether the connection that triggered this error should be closed.
    ///
    /// Everything else is contained: the frame is dropped and the
    /// connection keeps running.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            EnsembleError::UnknownInstance(_) | EnsembleError::AdmissionDenied(_)
        )
    }
}

impl From<serde_json::Error> for EnsembleError {
    fn from(e: serde_json::Error) -> Self {
        EnsembleError::InvalidMessage(e.to_string())
    }
}

pub type EnsembleResult<T> = Result<T, EnsembleError>;
