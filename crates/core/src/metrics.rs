use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Notifications dropped because the consumer fell behind.
pub const NOTIFICATIONS_DROPPED: &str = "registry_notifications_dropped";
/// Links evicted by the heartbeat sweep.
pub const SLAVE_EVICTIONS: &str = "slave_evictions_total";
/// Successful registrations, reconnects included.
pub const SLAVE_REGISTRATIONS: &str = "slave_registrations_total";
/// Links superseded by a newer registration for the same host.
pub const SLAVE_SUPERSEDED: &str = "slave_superseded_total";
/// Tool calls sent to slaves that timed out.
pub const TOOL_CALL_TIMEOUTS: &str = "slave_tool_call_timeouts_total";
/// Currently registered links.
pub const SLAVES_CONNECTED: &str = "slaves_connected";

/// Monotonically increasing value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub last_updated: DateTime<Utc>,
}

/// Value that can go up or down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: i64,
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time copy of every metric, as served by the admin API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<Counter>,
    pub gauges: Vec<Gauge>,
}

/// In-process counters and gauges for fleet observability.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Mutex<BTreeMap<String, Counter>>,
    gauges: Mutex<BTreeMap<String, Gauge>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str) {
        self.increment_counter_by(name, 1);
    }

    pub fn increment_counter_by(&self, name: &str, value: u64) {
        let now = Utc::now();
        lock(&self.counters)
            .entry(name.to_string())
            .and_modify(|c| {
                c.value += value;
                c.last_updated = now;
            })
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value,
                last_updated: now,
            });
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        let now = Utc::now();
        lock(&self.gauges)
            .entry(name.to_string())
            .and_modify(|g| {
                g.value = value;
                g.last_updated = now;
            })
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value,
                last_updated: now,
            });
    }

    /// Current counter value, zero when never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        lock(&self.counters).get(name).map(|c| c.value).unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<i64> {
        lock(&self.gauges).get(name).map(|g| g.value)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: lock(&self.counters).values().cloned().collect(),
            gauges: lock(&self.gauges).values().cloned().collect(),
        }
    }
}
