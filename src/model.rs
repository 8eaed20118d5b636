//! Records shared by the store, the coordinator, the scheduler and the
//! activity registry.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one running process in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to one chart: the machine it runs and its id within that machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChartRef {
    pub machine_id: String,
    pub chart_id: String,
}

impl ChartRef {
    pub fn new(machine_id: impl Into<String>, chart_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            chart_id: chart_id.into(),
        }
    }
}

impl fmt::Display for ChartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.chart_id)
    }
}

/// Row id of a persisted deferred event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeferredEventId(pub i64);

impl fmt::Display for DeferredEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chart to insert when a root or child machine is started.
#[derive(Debug, Clone)]
pub struct NewChart {
    pub chart: ChartRef,
    pub parent: Option<ChartRef>,
    /// Serialized snapshot owned by the chart runtime.
    pub state: Value,
}

/// Persisted chart row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRecord {
    pub chart: ChartRef,
    pub owner_id: InstanceId,
    pub parent: Option<ChartRef>,
    pub state: Value,
    pub paused: bool,
    pub timestamp: DateTime<Utc>,
}

/// Event to persist for delivery after `delay`.
#[derive(Debug, Clone)]
pub struct NewDeferredEvent {
    pub event_id: String,
    pub chart: ChartRef,
    pub event_to: Option<String>,
    pub event: Value,
    pub delay: Duration,
}

/// Persisted deferred event.
///
/// `due` is always `timestamp + delay`. `lock` names the instance that
/// claimed the row for delivery, `None` while the row is up for grabs.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredEvent {
    pub id: DeferredEventId,
    pub chart: ChartRef,
    pub event_id: String,
    pub event_to: Option<String>,
    pub event: Value,
    pub timestamp: DateTime<Utc>,
    pub delay_ms: i64,
    pub due: DateTime<Utc>,
    pub lock: Option<InstanceId>,
}

impl DeferredEvent {
    /// Time left until the event is due, zero when already overdue.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.due - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Fresh correlation id attached to every delivery so the host can trace
/// one event through the chart runtime.
pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
