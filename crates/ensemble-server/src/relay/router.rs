//! Relay router: classifies inbound frames and applies role-based forwarding.
//!
//! Binary frames are telemetry and only flow producer → aggregator. Text
//! frames are control messages; the set of kinds is closed and matched
//! exhaustively here.

use super::connection::Connection;
use super::registry::InstanceRegistry;
use crate::state::{lock, SharedAdmission};
use ensemble_core::{
    prefix_frame, ConnectionId, ControlMessage, EnsembleError, EnsembleResult, Role,
    TelemetrySchema,
};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Owns the registry and routes every frame of every connection.
pub struct RelayRouter {
    registry: InstanceRegistry,
    schema: TelemetrySchema,
    /// Present when producers must hold an approved admission session.
    admission: Option<SharedAdmission>,
}

impl RelayRouter {
    pub fn new(registry: InstanceRegistry, schema: TelemetrySchema) -> Self {
        Self {
            registry,
            schema,
            admission: None,
        }
    }

    /// Require approved admission sessions for producers.
    pub fn with_admission(mut self, admission: SharedAdmission) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut InstanceRegistry {
        &mut self.registry
    }

    /// Check whether a connection may take `role`.
    ///
    /// Aggregators need staff credentials; producers need an approved
    /// admission session when approval is enabled.
    pub fn authorize(&self, role: Role, session_id: Option<&str>, staff: bool) -> EnsembleResult<()> {
        match role {
            Role::Aggregator if !staff => Err(EnsembleError::UnauthorizedRole(
                "aggregator requires the shared secret".into(),
            )),
            Role::Aggregator => Ok(()),
            Role::Producer => {
                let Some(admission) = &self.admission else {
                    return Ok(());
                };
                let session_id = session_id.ok_or_else(|| {
                    EnsembleError::AdmissionDenied("no admission session".into())
                })?;
                if lock(admission).is_session_approved(session_id) {
                    Ok(())
                } else {
                    Err(EnsembleError::AdmissionDenied(format!(
                        "session {session_id} is not approved"
                    )))
                }
            }
        }
    }

    /// Handle a text frame from `conn`.
    pub fn handle_text(&mut self, conn: &Connection, text: &str) -> EnsembleResult<()> {
        let Some(msg) = ControlMessage::parse(text)? else {
            debug!(connection_id = %conn.id(), "ignoring unrecognized control message");
            return Ok(());
        };
        trace!(connection_id = %conn.id(), kind = msg.kind(), "control message");

        match msg {
            ControlMessage::Identify { role } => self.identify(conn, role),
            ControlMessage::AssignRole { musician_id, role } => {
                self.assign_role(conn, &musician_id, role)
            }
            ControlMessage::RoleAssigned { .. }
            | ControlMessage::Join { .. }
            | ControlMessage::Disconnect { .. }
            | ControlMessage::MusicianList { .. } => {
                debug!(connection_id = %conn.id(), kind = msg.kind(), "ignoring server-only message from client");
                Ok(())
            }
        }
    }

    /// Claim `role` for `conn` and bind it to its instance.
    ///
    /// Repeating the role already held is a no-op; switching roles is
    /// rejected.
    pub fn identify(&mut self, conn: &Connection, role: Role) -> EnsembleResult<()> {
        if conn.role() == Some(role) {
            debug!(connection_id = %conn.id(), %role, "role already claimed");
            return Ok(());
        }
        if !self.registry.contains(conn.instance_id()) {
            return Err(EnsembleError::UnknownInstance(conn.instance_id().to_string()));
        }
        self.authorize(role, conn.session_id(), conn.is_staff())?;

        if conn.claim_role(role)? {
            let instance_id = conn.instance_id().to_string();
            self.registry.bind(conn, &instance_id, role)?;
        }
        Ok(())
    }

    fn assign_role(&mut self, conn: &Connection, musician_id: &str, role: String) -> EnsembleResult<()> {
        if conn.role() != Some(Role::Aggregator) {
            return Err(EnsembleError::UnauthorizedRole(format!(
                "{} may not assign roles",
                conn.role().map_or("unassigned", Role::as_str)
            )));
        }
        let instance = self
            .registry
            .get(conn.instance_id())
            .ok_or_else(|| EnsembleError::UnknownInstance(conn.instance_id().to_string()))?;
        if !instance.aggregator().is_some_and(|a| a.same(conn)) {
            return Err(EnsembleError::UnauthorizedRole(
                "sender is not the bound aggregator".into(),
            ));
        }

        let target = musician_id
            .parse::<ConnectionId>()
            .ok()
            .and_then(|id| instance.producer(&id))
            .ok_or_else(|| EnsembleError::UnknownProducer(musician_id.to_string()))?;

        info!(
            instance_id = %instance.id(),
            producer_id = %target.id(),
            role = %role,
            "assigning role"
        );
        target.send_control(&ControlMessage::RoleAssigned { role });
        Ok(())
    }

    /// Forward a telemetry frame. Returns whether it was queued for the
    /// aggregator; frames with nowhere to go are dropped silently.
    pub fn handle_binary(&mut self, conn: &Connection, payload: &[u8]) -> EnsembleResult<bool> {
        if conn.role() != Some(Role::Producer) {
            trace!(connection_id = %conn.id(), "dropping binary frame from non-producer");
            return Ok(false);
        }
        self.schema.validate(payload)?;

        let Some(instance) = self.registry.get_mut(conn.instance_id()) else {
            return Ok(false);
        };
        if !instance.producer(conn.id()).is_some_and(|p| p.same(conn)) {
            return Ok(false);
        }
        instance.touch(Instant::now());

        match instance.live_aggregator() {
            Some(aggregator) => Ok(aggregator.send_binary(prefix_frame(conn.id(), payload))),
            None => Ok(false),
        }
    }

    /// Remove a closing connection from its instance.
    pub fn disconnect(&mut self, conn: &Connection) -> bool {
        conn.close();
        self.registry.unbind(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AdmissionConfig, AdmissionService};
    use crate::relay::connection::Outbound;
    use crate::relay::registry::AggregatorPolicy;
    use ensemble_core::codec::MotionSample;
    use ensemble_core::decode_forwarded;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn router() -> RelayRouter {
        let mut registry = InstanceRegistry::new(AggregatorPolicy::KeepAlive);
        registry.create_instance("X");
        RelayRouter::new(registry, TelemetrySchema::V1)
    }

    fn open(instance: &str) -> (Connection, mpsc::Receiver<Outbound>) {
        Connection::new(instance, None, true, 16)
    }

    fn identify(router: &mut RelayRouter, conn: &Connection, role: &str) -> EnsembleResult<()> {
        router.handle_text(conn, &format!(r#"{{"type":"identify","role":"{role}"}}"#))
    }

    fn next_control(rx: &mut mpsc::Receiver<Outbound>) -> Option<ControlMessage> {
        match rx.try_recv().ok()? {
            Outbound::Text(text) => ControlMessage::parse(&text).unwrap(),
            Outbound::Binary(_) => None,
        }
    }

    #[test]
    fn end_to_end_scenario() {
        let mut router = router();

        let (a, mut a_rx) = open("X");
        identify(&mut router, &a, "producer").unwrap();
        assert!(a_rx.try_recv().is_err());

        let (stage, mut stage_rx) = open("X");
        identify(&mut router, &stage, "aggregator").unwrap();
        assert_eq!(
            next_control(&mut stage_rx),
            Some(ControlMessage::MusicianList {
                musicians: vec![a.id().to_string()]
            })
        );

        let mut payload = vec![0u8; 37];
        payload[0] = 0x01;
        assert!(router.handle_binary(&a, &payload).unwrap());

        let frame = match stage_rx.try_recv().unwrap() {
            Outbound::Binary(frame) => frame,
            other => panic!("expected binary frame, got {other:?}"),
        };
        assert_eq!(frame.len(), 73);
        assert_eq!(&frame[..36], a.id().as_bytes());
        assert_eq!(&frame[36..], &payload[..]);

        let (sender, sample) = decode_forwarded(TelemetrySchema::V1, &frame).unwrap();
        assert_eq!(&sender, a.id());
        match sample {
            MotionSample::V1(s) => {
                assert!(s.flags.tracking);
                assert_eq!(s.velocity.x, 0.0);
                assert_eq!(s.orientation.gamma, 0.0);
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[test]
    fn telemetry_is_dropped_without_aggregator() {
        let mut router = router();
        let (p, _rx) = open("X");
        identify(&mut router, &p, "producer").unwrap();
        assert!(!router.handle_binary(&p, &[0u8; 37]).unwrap());
    }

    #[test]
    fn telemetry_from_non_producer_is_dropped() {
        let mut router = router();
        let (stage, mut stage_rx) = open("X");
        identify(&mut router, &stage, "aggregator").unwrap();
        next_control(&mut stage_rx);

        let (unassigned, _rx) = open("X");
        assert!(!router.handle_binary(&unassigned, &[0u8; 37]).unwrap());
        assert!(!router.handle_binary(&stage, &[0u8; 37]).unwrap());
        assert!(stage_rx.try_recv().is_err());
    }

    #[test]
    fn wrong_length_is_a_framing_error() {
        let mut router = router();
        let (p, _rx) = open("X");
        identify(&mut router, &p, "producer").unwrap();
        let err = router.handle_binary(&p, &[0u8; 45]).unwrap_err();
        assert!(matches!(err, EnsembleError::Framing(_)));
        assert!(!err.closes_connection());
    }

    #[test]
    fn identify_is_processed_once() {
        let mut router = router();
        let (conn, _rx) = open("X");
        identify(&mut router, &conn, "musician").unwrap();
        identify(&mut router, &conn, "producer").unwrap();
        assert_eq!(router.registry().get("X").unwrap().producer_count(), 1);

        let err = identify(&mut router, &conn, "stage").unwrap_err();
        assert!(matches!(err, EnsembleError::RoleConflict(_)));
        assert!(router.registry().get("X").unwrap().aggregator().is_none());
    }

    #[test]
    fn identify_unknown_instance_closes() {
        let mut router = router();
        let (conn, _rx) = open("missing");
        let err = identify(&mut router, &conn, "producer").unwrap_err();
        assert!(matches!(err, EnsembleError::UnknownInstance(_)));
        assert!(err.closes_connection());
        assert_eq!(conn.role(), None);
    }

    #[test]
    fn assign_role_forwards_to_one_producer() {
        let mut router = router();
        let (p1, mut p1_rx) = open("X");
        let (p2, mut p2_rx) = open("X");
        identify(&mut router, &p1, "producer").unwrap();
        identify(&mut router, &p2, "producer").unwrap();
        let (stage, _stage_rx) = open("X");
        identify(&mut router, &stage, "aggregator").unwrap();

        let msg = format!(r#"{{"type":"assign-role","musicianId":"{}","role":"melody"}}"#, p2.id());
        router.handle_text(&stage, &msg).unwrap();

        assert!(p1_rx.try_recv().is_err());
        assert_eq!(
            next_control(&mut p2_rx),
            Some(ControlMessage::RoleAssigned { role: "melody".into() })
        );
    }

    #[test]
    fn assign_role_rejections() {
        let mut router = router();
        let (p, _p_rx) = open("X");
        identify(&mut router, &p, "producer").unwrap();
        let (stage, _stage_rx) = open("X");
        identify(&mut router, &stage, "aggregator").unwrap();

        let from_producer = format!(r#"{{"type":"assign-role","musicianId":"{}","role":"x"}}"#, p.id());
        assert!(matches!(
            router.handle_text(&p, &from_producer),
            Err(EnsembleError::UnauthorizedRole(_))
        ));

        let unknown = r#"{"type":"assign-role","musicianId":"nobody","role":"x"}"#;
        let err = router.handle_text(&stage, unknown).unwrap_err();
        assert!(matches!(err, EnsembleError::UnknownProducer(_)));
        assert!(!err.closes_connection());
    }

    #[test]
    fn replaced_aggregator_cannot_assign() {
        let mut router = router();
        let (p, _p_rx) = open("X");
        identify(&mut router, &p, "producer").unwrap();
        let (old, _old_rx) = open("X");
        identify(&mut router, &old, "aggregator").unwrap();
        let (new, _new_rx) = open("X");
        identify(&mut router, &new, "aggregator").unwrap();

        let msg = format!(r#"{{"type":"assign-role","musicianId":"{}","role":"x"}}"#, p.id());
        assert!(matches!(
            router.handle_text(&old, &msg),
            Err(EnsembleError::UnauthorizedRole(_))
        ));
    }

    #[test]
    fn unknown_and_server_only_kinds_are_ignored() {
        let mut router = router();
        let (conn, _rx) = open("X");
        router.handle_text(&conn, r#"{"type":"sensorData","payload":{}}"#).unwrap();
        router
            .handle_text(&conn, r#"{"type":"musician-list","musicians":[]}"#)
            .unwrap();
        assert_eq!(conn.role(), None);
        assert!(matches!(
            router.handle_text(&conn, "{oops"),
            Err(EnsembleError::InvalidMessage(_))
        ));
    }

    #[test]
    fn disconnect_notifies_aggregator_once() {
        let mut router = router();
        let (stage, mut stage_rx) = open("X");
        identify(&mut router, &stage, "aggregator").unwrap();
        let (p, _rx) = open("X");
        identify(&mut router, &p, "producer").unwrap();
        while stage_rx.try_recv().is_ok() {}

        assert!(router.disconnect(&p));
        assert!(!router.disconnect(&p));
        assert_eq!(
            next_control(&mut stage_rx),
            Some(ControlMessage::Disconnect {
                role: Role::Producer,
                id: p.id().to_string(),
                count: 0
            })
        );
        assert!(stage_rx.try_recv().is_err());
    }

    #[test]
    fn aggregator_without_staff_credentials_is_refused() {
        let mut router = router();
        let (conn, _rx) = Connection::new("X", None, false, 4);
        let err = identify(&mut router, &conn, "aggregator").unwrap_err();
        assert!(matches!(err, EnsembleError::UnauthorizedRole(_)));
        assert_eq!(conn.role(), None);
    }

    #[test]
    fn producers_need_approved_sessions() {
        let admission = Arc::new(Mutex::new(AdmissionService::new(AdmissionConfig::default())));
        let mut router = router().with_admission(admission.clone());

        let (anonymous, _rx) = open("X");
        let err = identify(&mut router, &anonymous, "producer").unwrap_err();
        assert!(matches!(err, EnsembleError::AdmissionDenied(_)));
        assert!(err.closes_connection());

        lock(&admission).create_pending_session("s1").unwrap();
        let (pending, _rx) = Connection::new("X", Some("s1".into()), false, 4);
        assert!(identify(&mut router, &pending, "producer").is_err());

        lock(&admission).approve_session("s1").unwrap();
        let (approved, _rx) = Connection::new("X", Some("s1".into()), false, 4);
        identify(&mut router, &approved, "producer").unwrap();
        assert_eq!(router.registry().get("X").unwrap().producer_count(), 1);
    }
}
