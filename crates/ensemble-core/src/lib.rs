//! ensemble-core: Shared protocol library for the ensemble relay.
//!
//! Provides the binary telemetry codec, control message types, connection
//! identities, admission codes, and the error type shared by server and tools.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_forwarded, decode_payload, prefix_frame, MotionFlags, MotionSample, TelemetrySchema};
pub use error::{EnsembleError, EnsembleResult, FramingError};
pub use identity::{is_valid_instance_id, ConnectionId, IDENTITY_LEN};
pub use messages::{ControlMessage, Role};
pub use token::{generate_code, normalize_code};
