//! Token-based admission of producer sessions.
//!
//! A producer device asks for a pending session and shows its short token;
//! staff approve the token out of band. Tokens rotate on a fixed cadence so a
//! code glimpsed on a screen stops working quickly. Only approved sessions may
//! open producer connections.

use ensemble_core::token::{generate_code, normalize_code, DEFAULT_CODE_LEN};
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default lifetime of an unapproved session.
pub const DEFAULT_MAX_PENDING_AGE: Duration = Duration::from_secs(300);

/// Random draws per token before giving up.
const MAX_TOKEN_ATTEMPTS: usize = 64;

/// Tuning for [`AdmissionService`].
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub token_len: usize,
    pub max_pending_age: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            token_len: DEFAULT_CODE_LEN,
            max_pending_age: DEFAULT_MAX_PENDING_AGE,
        }
    }
}

/// A session waiting for approval.
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub session_id: String,
    pub token: String,
    pub created_at: Instant,
    pub rotated_at: Instant,
}

/// Pending and approved sessions, with a token → session reverse index.
#[derive(Debug)]
pub struct AdmissionService {
    config: AdmissionConfig,
    pending: HashMap<String, PendingSession>,
    by_token: HashMap<String, String>,
    approved: HashSet<String>,
}

impl AdmissionService {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config: AdmissionConfig {
                token_len: config.token_len.max(1),
                ..config
            },
            pending: HashMap::new(),
            by_token: HashMap::new(),
            approved: HashSet::new(),
        }
    }

    /// Register `session_id` as pending and return its token.
    ///
    /// A session that is already pending keeps its current token.
    pub fn create_pending_session(&mut self, session_id: &str) -> EnsembleResult<String> {
        if self.approved.contains(session_id) {
            return Err(EnsembleError::AlreadyApproved(session_id.to_string()));
        }
        if let Some(existing) = self.pending.get(session_id) {
            return Ok(existing.token.clone());
        }

        let token = self.fresh_token(None, &self.by_token)?;
        let now = Instant::now();
        self.by_token.insert(token.clone(), session_id.to_string());
        self.pending.insert(
            session_id.to_string(),
            PendingSession {
                session_id: session_id.to_string(),
                token: token.clone(),
                created_at: now,
                rotated_at: now,
            },
        );
        debug!(session_id, "pending session created");
        Ok(token)
    }

    /// Give every pending session a new token. Returns how many rotated.
    ///
    /// Each new token differs from the session's previous one and from every
    /// token issued in the same pass. The reverse index is rebuilt and swapped
    /// in whole. On failure nothing changes.
    pub fn rotate_tokens(&mut self) -> EnsembleResult<usize> {
        let now = Instant::now();
        let mut next: HashMap<String, String> = HashMap::with_capacity(self.pending.len());
        for (session_id, session) in &self.pending {
            let token = self.fresh_token(Some(&session.token), &next)?;
            next.insert(token, session_id.clone());
        }
        for (token, session_id) in &next {
            if let Some(session) = self.pending.get_mut(session_id) {
                session.token = token.clone();
                session.rotated_at = now;
            }
        }
        self.by_token = next;
        Ok(self.pending.len())
    }

    /// Drop pending sessions older than the configured age. Returns the
    /// purged session ids.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<String> {
        let max_age = self.config.max_pending_age;
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|s| now.saturating_duration_since(s.created_at) > max_age)
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &expired {
            if let Some(session) = self.pending.remove(session_id) {
                self.by_token.remove(&session.token);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "purged expired pending sessions");
        }
        expired
    }

    /// Move a session from pending to approved.
    pub fn approve_session(&mut self, session_id: &str) -> EnsembleResult<()> {
        if self.approved.contains(session_id) {
            return Ok(());
        }
        let session = self
            .pending
            .remove(session_id)
            .ok_or_else(|| EnsembleError::SessionNotFound(session_id.to_string()))?;
        self.by_token.remove(&session.token);
        self.approved.insert(session.session_id);
        info!(session_id, "session approved");
        Ok(())
    }

    /// Resolve `token` and approve its session. Returns the session id.
    pub fn approve_by_token(&mut self, token: &str) -> EnsembleResult<String> {
        let session_id = self.get_session_by_token(token)?;
        self.approve_session(&session_id)?;
        Ok(session_id)
    }

    pub fn is_session_approved(&self, session_id: &str) -> bool {
        self.approved.contains(session_id)
    }

    /// Look up the session a human-entered token belongs to.
    pub fn get_session_by_token(&self, token: &str) -> EnsembleResult<String> {
        self.by_token
            .get(&normalize_code(token))
            .cloned()
            .ok_or(EnsembleError::StaleToken)
    }

    /// Current token of a pending session.
    pub fn pending_token(&self, session_id: &str) -> Option<&str> {
        self.pending.get(session_id).map(|s| s.token.as_str())
    }

    /// Forget a session entirely. Returns whether anything was removed.
    ///
    /// Connections already open under the session are left alone.
    pub fn revoke_session(&mut self, session_id: &str) -> bool {
        let was_approved = self.approved.remove(session_id);
        let was_pending = match self.pending.remove(session_id) {
            Some(session) => {
                self.by_token.remove(&session.token);
                true
            }
            None => false,
        };
        if was_approved || was_pending {
            info!(session_id, "session revoked");
        }
        was_approved || was_pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn approved_count(&self) -> usize {
        self.approved.len()
    }

    fn fresh_token(
        &self,
        previous: Option<&str>,
        taken: &HashMap<String, String>,
    ) -> EnsembleResult<String> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = generate_code(self.config.token_len);
            if Some(token.as_str()) != previous && !taken.contains_key(&token) {
                return Ok(token);
            }
        }
        warn!(
            token_len = self.config.token_len,
            pending = self.pending.len(),
            "admission token space exhausted"
        );
        Err(EnsembleError::TokenSpaceExhausted(MAX_TOKEN_ATTEMPTS))
    }
}
