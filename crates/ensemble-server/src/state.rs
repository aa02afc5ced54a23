//! Shared state handles.
//!
//! Relay and admission state are only touched inside short synchronous
//! sections, so plain `std::sync::Mutex` is enough; guards must never be held
//! across an `.await`. Lock order: relay first, then admission.

use crate::auth::AdmissionService;
use crate::relay::RelayRouter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SharedRelay = Arc<Mutex<RelayRouter>>;
pub type SharedAdmission = Arc<Mutex<AdmissionService>>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
