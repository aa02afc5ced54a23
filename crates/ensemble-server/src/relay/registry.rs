//! Instance registry: rooms, their aggregator slot, and their producers.
//!
//! Every mutation removes state before it notifies anyone, so a connection
//! that is unbound twice (close event racing a forced close) is a no-op the
//! second time.

use super::connection::Connection;
use ensemble_core::{ConnectionId, ControlMessage, EnsembleError, EnsembleResult, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What happens to an instance when its aggregator leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregatorPolicy {
    /// Keep the instance and its producers; the reaper reclaims it later.
    #[default]
    KeepAlive,
    /// Close every producer and remove the instance immediately.
    TearDown,
}

impl fmt::Display for AggregatorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregatorPolicy::KeepAlive => "keep-alive",
            AggregatorPolicy::TearDown => "tear-down",
        })
    }
}

impl FromStr for AggregatorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-alive" => Ok(AggregatorPolicy::KeepAlive),
            "tear-down" => Ok(AggregatorPolicy::TearDown),
            other => Err(format!("unknown aggregator policy: {other}")),
        }
    }
}

/// One performance instance (room).
#[derive(Debug)]
pub struct Instance {
    id: String,
    aggregator: Option<Connection>,
    producers: HashMap<ConnectionId, Connection>,
    created_at: Instant,
    last_activity: Instant,
}

impl Instance {
    fn new(id: String, now: Instant) -> Self {
        Self {
            id,
            aggregator: None,
            producers: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn aggregator(&self) -> Option<&Connection> {
        self.aggregator.as_ref()
    }

    /// Aggregator that is bound and still reachable.
    pub fn live_aggregator(&self) -> Option<&Connection> {
        self.aggregator.as_ref().filter(|a| a.is_open())
    }

    pub fn producer(&self, id: &ConnectionId) -> Option<&Connection> {
        self.producers.get(id)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.keys().map(|id| id.to_string()).collect()
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    fn close_all(&self) {
        if let Some(aggregator) = &self.aggregator {
            aggregator.close();
        }
        for producer in self.producers.values() {
            producer.close();
        }
    }
}

/// Listing entry for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub instance_id: String,
    pub aggregator: bool,
    pub producers: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// All instances known to this process.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: HashMap<String, Instance>,
    policy: AggregatorPolicy,
}

impl InstanceRegistry {
    pub fn new(policy: AggregatorPolicy) -> Self {
        Self {
            instances: HashMap::new(),
            policy,
        }
    }

    /// Create an instance. Returns `false` (and leaves the live instance
    /// untouched) when the id already exists.
    pub fn create_instance(&mut self, id: &str) -> bool {
        if self.instances.contains_key(id) {
            debug!(instance_id = %id, "instance already exists");
            return false;
        }
        info!(instance_id = %id, "creating new instance");
        self.instances
            .insert(id.to_string(), Instance::new(id.to_string(), Instant::now()));
        true
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Attach a connection to an instance under `role`.
    pub fn bind(&mut self, conn: &Connection, instance_id: &str, role: Role) -> EnsembleResult<()> {
        let instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| EnsembleError::UnknownInstance(instance_id.to_string()))?;
        instance.touch(Instant::now());

        match role {
            Role::Aggregator => join_aggregator(instance, conn),
            Role::Producer => join_producer(instance, conn),
        }
        Ok(())
    }

    /// Detach a closing connection. Returns whether any state changed.
    pub fn unbind(&mut self, conn: &Connection) -> bool {
        match conn.role() {
            Some(Role::Aggregator) => self.unbind_aggregator(conn),
            Some(Role::Producer) => self.unbind_producer(conn),
            None => false,
        }
    }

    fn unbind_aggregator(&mut self, conn: &Connection) -> bool {
        let Some(instance) = self.instances.get_mut(conn.instance_id()) else {
            return false;
        };
        if !instance.aggregator.as_ref().is_some_and(|a| a.same(conn)) {
            return false;
        }
        instance.aggregator = None;
        instance.touch(Instant::now());

        match self.policy {
            AggregatorPolicy::KeepAlive => {
                info!(instance_id = %instance.id, "aggregator disconnected, instance kept alive");
            }
            AggregatorPolicy::TearDown => {
                if let Some(instance) = self.instances.remove(conn.instance_id()) {
                    info!(
                        instance_id = %instance.id,
                        producers = instance.producers.len(),
                        "aggregator disconnected, tearing instance down"
                    );
                    instance.close_all();
                }
            }
        }
        true
    }

    fn unbind_producer(&mut self, conn: &Connection) -> bool {
        let Some(instance) = self.instances.get_mut(conn.instance_id()) else {
            return false;
        };
        if !instance.producers.get(conn.id()).is_some_and(|p| p.same(conn)) {
            return false;
        }
        instance.producers.remove(conn.id());
        instance.touch(Instant::now());

        let count = instance.producers.len();
        info!(instance_id = %instance.id, producer_id = %conn.id(), count, "producer left");
        if let Some(aggregator) = instance.live_aggregator() {
            aggregator.send_control(&ControlMessage::Disconnect {
                role: Role::Producer,
                id: conn.id().to_string(),
                count,
            });
        }
        true
    }

    /// Close every socket of an instance and remove it.
    pub fn remove_instance(&mut self, id: &str) -> bool {
        match self.instances.remove(id) {
            Some(instance) => {
                info!(instance_id = %id, producers = instance.producers.len(), "removing instance");
                instance.close_all();
                true
            }
            None => false,
        }
    }

    /// Remove instances with no live aggregator that have been idle for
    /// longer than `stale_after`. Returns the removed ids.
    pub fn sweep_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .instances
            .values()
            .filter(|i| {
                i.live_aggregator().is_none()
                    && now.saturating_duration_since(i.last_activity) > stale_after
            })
            .map(|i| i.id.clone())
            .collect();

        for id in &stale {
            if let Some(instance) = self.instances.remove(id) {
                info!(
                    instance_id = %id,
                    inactive_minutes = now.saturating_duration_since(instance.last_activity).as_secs() / 60,
                    "cleaning up stale instance"
                );
                instance.close_all();
            }
        }
        stale
    }

    pub fn summaries(&self, now: Instant) -> Vec<InstanceSummary> {
        let mut list: Vec<InstanceSummary> = self
            .instances
            .values()
            .map(|i| InstanceSummary {
                instance_id: i.id.clone(),
                aggregator: i.live_aggregator().is_some(),
                producers: i.producer_count(),
                age_secs: now.saturating_duration_since(i.created_at).as_secs(),
                idle_secs: now.saturating_duration_since(i.last_activity).as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }
}

fn join_aggregator(instance: &mut Instance, conn: &Connection) {
    if let Some(previous) = instance.aggregator.replace(conn.clone()) {
        if !previous.same(conn) {
            info!(
                instance_id = %instance.id,
                previous = %previous.id(),
                "replacing aggregator, closing previous connection"
            );
            previous.close();
        }
    }
    info!(instance_id = %instance.id, aggregator_id = %conn.id(), "aggregator connected to instance");

    conn.send_control(&ControlMessage::MusicianList {
        musicians: instance.producer_ids(),
    });
}

fn join_producer(instance: &mut Instance, conn: &Connection) {
    instance.producers.insert(conn.id().clone(), conn.clone());
    let count = instance.producers.len();
    info!(instance_id = %instance.id, producer_id = %conn.id(), count, "producer connected to instance");

    if let Some(aggregator) = instance.live_aggregator() {
        aggregator.send_control(&ControlMessage::Join {
            role: Role::Producer,
            id: conn.id().to_string(),
            count,
        });
    }
}
