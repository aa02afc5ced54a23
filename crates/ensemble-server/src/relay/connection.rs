//! Connection envelope: identity, role slot, and outbound queue for one socket.
//!
//! A [`Connection`] is a cheap handle. The socket task owns the receiving end
//! of the outbound queue; the registry keeps clones of the handle to address
//! the connection. Nothing here blocks: sends go through `try_send` and are
//! dropped when the queue is full or the socket is gone.

use ensemble_core::{ConnectionId, ControlMessage, EnsembleError, EnsembleResult, Role};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

/// A frame queued for delivery to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

struct Inner {
    id: ConnectionId,
    instance_id: String,
    session_id: Option<String>,
    /// Presented the shared secret at upgrade (or none is configured).
    staff: bool,
    role: OnceLock<Role>,
    tx: mpsc::Sender<Outbound>,
    closing: AtomicBool,
    close_notify: Notify,
}

/// Handle to one live client connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a handle with a fresh identity and an outbound queue of
    /// `queue` frames.
    pub fn new(
        instance_id: impl Into<String>,
        session_id: Option<String>,
        staff: bool,
        queue: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let conn = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::generate(),
                instance_id: instance_id.into(),
                session_id,
                staff,
                role: OnceLock::new(),
                tx,
                closing: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        };
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.as_deref()
    }

    pub fn is_staff(&self) -> bool {
        self.inner.staff
    }

    /// The claimed role, `None` while unassigned.
    pub fn role(&self) -> Option<Role> {
        self.inner.role.get().copied()
    }

    /// Set the role slot.
    ///
    /// Returns `Ok(true)` when the role was set by this call, `Ok(false)` when
    /// the same role was already held, and `RoleConflict` otherwise.
    pub fn claim_role(&self, role: Role) -> EnsembleResult<bool> {
        match self.inner.role.set(role) {
            Ok(()) => Ok(true),
            Err(_) => match self.role() {
                Some(current) if current == role => Ok(false),
                current => Err(EnsembleError::RoleConflict(format!(
                    "{} is {}, cannot become {role}",
                    self.inner.id,
                    current.map_or("unassigned", Role::as_str)
                ))),
            },
        }
    }

    /// Whether frames sent now could still reach the client.
    pub fn is_open(&self) -> bool {
        !self.inner.closing.load(Ordering::Acquire) && !self.inner.tx.is_closed()
    }

    /// Queue a control message. Returns whether it was queued.
    pub fn send_control(&self, msg: &ControlMessage) -> bool {
        match msg.to_json() {
            Ok(json) => self.push(Outbound::Text(json)),
            Err(e) => {
                warn!(connection_id = %self.inner.id, error = %e, "failed to encode control message");
                false
            }
        }
    }

    /// Queue a binary frame. Returns whether it was queued.
    pub fn send_binary(&self, frame: Vec<u8>) -> bool {
        self.push(Outbound::Binary(frame))
    }

    fn push(&self, frame: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.inner.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(connection_id = %self.inner.id, "outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the socket task to close the connection. Idempotent.
    pub fn close(&self) {
        if !self.inner.closing.swap(true, Ordering::AcqRel) {
            debug!(connection_id = %self.inner.id, "close requested");
            self.inner.close_notify.notify_one();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn close_requested(&self) {
        if self.is_closing() {
            return;
        }
        self.inner.close_notify.notified().await;
    }

    /// Whether both handles refer to the same connection.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("instance_id", &self.inner.instance_id)
            .field("role", &self.role())
            .field("open", &self.is_open())
            .finish()
    }
}
