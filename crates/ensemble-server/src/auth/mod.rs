//! Admission sessions, staff secret, and rate limiting.

pub mod admission;
pub mod rate_limit;
pub mod secret;

pub use admission::{AdmissionConfig, AdmissionService};
pub use rate_limit::ServerRateLimits;
pub use secret::SharedSecret;
