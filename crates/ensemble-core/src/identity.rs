//! Connection identities and instance ids.
//!
//! A connection identity is a random UUIDv4 in its hyphenated form, so it is
//! always exactly [`IDENTITY_LEN`] ASCII bytes. That fixed width is what lets
//! the relay prefix telemetry frames with the sender without any length field.

use crate::error::FramingError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Width of a serialized connection identity in bytes.
pub const IDENTITY_LEN: usize = 36;

/// Longest instance id accepted from clients.
pub const MAX_INSTANCE_ID_LEN: usize = 64;

/// Opaque, unguessable identity assigned to a connection at accept time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parse an identity from its fixed-width ASCII form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() != IDENTITY_LEN {
            return Err(FramingError::Identity);
        }
        let uuid = Uuid::try_parse_ascii(bytes).map_err(|_| FramingError::Identity)?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = FramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

/// Check that an instance id is safe to use in URLs and logs.
///
/// Accepts 1..=64 characters from `[A-Za-z0-9_-]`.
pub fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_INSTANCE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
