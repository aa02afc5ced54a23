//! Periodic sweep of idle instances.

use crate::state::{lock, SharedRelay};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the reaper. Every `interval` it removes instances with no live
/// aggregator that have been idle for longer than `stale_after`.
pub fn spawn(relay: SharedRelay, interval: Duration, stale_after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = lock(&relay)
                .registry_mut()
                .sweep_stale(Instant::now(), stale_after);
            if removed.is_empty() {
                debug!("reaper pass found nothing stale");
            } else {
                info!(count = removed.len(), instances = ?removed, "reaped stale instances");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{AggregatorPolicy, InstanceRegistry, RelayRouter};
    use ensemble_core::TelemetrySchema;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn reaper_removes_idle_instances() {
        let mut registry = InstanceRegistry::new(AggregatorPolicy::KeepAlive);
        registry.create_instance("idle");
        let relay = Arc::new(Mutex::new(RelayRouter::new(registry, TelemetrySchema::V1)));

        let handle = spawn(relay.clone(), Duration::from_millis(10), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(lock(&relay).registry().len(), 0);
    }

    #[tokio::test]
    async fn reaper_keeps_staged_instances() {
        let mut registry = InstanceRegistry::new(AggregatorPolicy::KeepAlive);
        registry.create_instance("live");
        let relay = Arc::new(Mutex::new(RelayRouter::new(registry, TelemetrySchema::V1)));
        let (stage, _rx) = crate::relay::Connection::new("live", None, true, 4);
        lock(&relay)
            .identify(&stage, ensemble_core::Role::Aggregator)
            .unwrap();

        let handle = spawn(relay.clone(), Duration::from_millis(10), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(lock(&relay).registry().contains("live"));
    }
}
