//! Control-plane messages carried in WebSocket text frames.

use crate::error::EnsembleResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection role claimed by a client.
///
/// Older clients say `stage`/`conductor` and `musician`; those are accepted
/// on input and normalized on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "stage", alias = "conductor")]
    Aggregator,
    #[serde(alias = "musician")]
    Producer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Aggregator => "aggregator",
            Role::Producer => "producer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aggregator" | "stage" | "conductor" => Ok(Role::Aggregator),
            "producer" | "musician" => Ok(Role::Producer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Every control frame kind, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Client → server: claim a connection role.
    Identify { role: Role },

    /// Aggregator → server: hand a performance part to one producer.
    AssignRole {
        #[serde(rename = "musicianId")]
        musician_id: String,
        role: String,
    },

    /// Server → producer: the part assigned by the aggregator.
    RoleAssigned { role: String },

    /// Server → aggregator: a producer joined.
    Join { role: Role, id: String, count: usize },

    /// Server → aggregator: a producer left.
    Disconnect { role: Role, id: String, count: usize },

    /// Server → aggregator: snapshot of connected producers.
    MusicianList { musicians: Vec<String> },
}

/// `type` tags understood by [`ControlMessage`].
const KNOWN_KINDS: &[&str] = &[
    "identify",
    "assign-role",
    "role-assigned",
    "join",
    "disconnect",
    "musician-list",
];

impl ControlMessage {
    /// Parse a text frame.
    ///
    /// Returns `Ok(None)` for well-formed JSON whose `type` is not a known
    /// kind, and an error for anything that is not a JSON object with a
    /// string `type` or whose fields do not match the kind.
    pub fn parse(text: &str) -> EnsembleResult<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                crate::EnsembleError::InvalidMessage("missing \"type\" field".into())
            })?;
        if !KNOWN_KINDS.contains(&kind) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub fn to_json(&self) -> EnsembleResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Name of the kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Identify { .. } => "identify",
            ControlMessage::AssignRole { .. } => "assign-role",
            ControlMessage::RoleAssigned { .. } => "role-assigned",
            ControlMessage::Join { .. } => "join",
            ControlMessage::Disconnect { .. } => "disconnect",
            ControlMessage::MusicianList { .. } => "musician-list",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identify_accepts_legacy_role_names() {
        let msg = ControlMessage::parse(r#"{"type":"identify","role":"stage"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Identify {
                role: Role::Aggregator
            }
        );

        let msg = ControlMessage::parse(r#"{"type":"identify","role":"musician"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg, ControlMessage::Identify { role: Role::Producer });
    }

    #[test]
    fn assign_role_uses_camel_case_target() {
        let msg = ControlMessage::parse(r#"{"type":"assign-role","musicianId":"abc","role":"drums"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            ControlMessage::AssignRole {
                musician_id: "abc".into(),
                role: "drums".into()
            }
        );
    }

    #[test]
    fn outbound_wire_shapes() {
        let join = ControlMessage::Join {
            role: Role::Producer,
            id: "p1".into(),
            count: 2,
        };
        let v: serde_json::Value = serde_json::from_str(&join.to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "join", "role": "producer", "id": "p1", "count": 2}));

        let list = ControlMessage::MusicianList {
            musicians: vec!["a".into(), "b".into()],
        };
        let v: serde_json::Value = serde_json::from_str(&list.to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "musician-list", "musicians": ["a", "b"]}));

        let assigned = ControlMessage::RoleAssigned { role: "bass".into() };
        let v: serde_json::Value = serde_json::from_str(&assigned.to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "role-assigned", "role": "bass"}));
    }

    #[test]
    fn unknown_kind_is_ignored() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"sensorData","payload":{}}"#).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(ControlMessage::parse("not json").is_err());
        assert!(ControlMessage::parse(r#"{"role":"producer"}"#).is_err());
        assert!(ControlMessage::parse(r#"{"type":"identify","role":"drummer"}"#).is_err());
    }

    #[test]
    fn role_from_str() {
        assert_eq!("conductor".parse::<Role>().unwrap(), Role::Aggregator);
        assert_eq!("producer".parse::<Role>().unwrap(), Role::Producer);
        assert!("audience".parse::<Role>().is_err());
    }
}
