//! Instance registry and telemetry relay.

pub mod connection;
pub mod reaper;
pub mod registry;
pub mod router;

pub use connection::{Connection, Outbound};
pub use registry::{AggregatorPolicy, InstanceRegistry, InstanceSummary};
pub use router::RelayRouter;
