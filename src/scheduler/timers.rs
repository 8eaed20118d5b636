//! Per-event delivery timers keyed by deferred event id.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::task::AbortHandle;

use crate::model::{ChartRef, DeferredEvent, DeferredEventId};

struct ArmedTimer {
    event: DeferredEvent,
    handle: AbortHandle,
}

/// Timers for events this instance has claimed and not yet handed off.
///
/// An entry is removed exactly once: by the timer itself when it fires
/// (`take`) or by cancellation, which also aborts the task. Whoever removes
/// the entry owns the event from then on.
#[derive(Default)]
pub(crate) struct TimerSet {
    armed: Mutex<HashMap<DeferredEventId, ArmedTimer>>,
}

impl TimerSet {
    /// Register a timer. `spawn` runs with the map locked, so the spawned
    /// task cannot observe the map before its own entry is in it.
    pub fn arm<F>(&self, event: DeferredEvent, spawn: F)
    where
        F: FnOnce() -> AbortHandle,
    {
        let mut armed = self.armed.lock().expect("timer set poisoned");
        let handle = spawn();
        if let Some(previous) = armed.insert(event.id, ArmedTimer { event, handle }) {
            previous.handle.abort();
        }
    }

    /// Remove the entry for a firing timer without aborting it.
    pub fn take(&self, id: DeferredEventId) -> Option<DeferredEvent> {
        self.armed
            .lock()
            .expect("timer set poisoned")
            .remove(&id)
            .map(|timer| timer.event)
    }

    /// Abort and remove every timer for `(chart, event_id)`.
    pub fn cancel_matching(&self, chart: &ChartRef, event_id: &str) -> Vec<DeferredEvent> {
        let mut armed = self.armed.lock().expect("timer set poisoned");
        let ids: Vec<DeferredEventId> = armed
            .values()
            .filter(|timer| &timer.event.chart == chart && timer.event.event_id == event_id)
            .map(|timer| timer.event.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| armed.remove(&id))
            .map(|timer| {
                timer.handle.abort();
                timer.event
            })
            .collect()
    }

    /// Abort and remove every timer.
    pub fn cancel_all(&self) -> Vec<DeferredEvent> {
        let mut armed = self.armed.lock().expect("timer set poisoned");
        let mut events: Vec<DeferredEvent> = armed
            .drain()
            .map(|(_, timer)| {
                timer.handle.abort();
                timer.event
            })
            .collect();
        events.sort_by_key(|event| event.id);
        events
    }

    pub fn len(&self) -> usize {
        self.armed.lock().expect("timer set poisoned").len()
    }

    pub fn ids(&self) -> Vec<DeferredEventId> {
        let mut ids: Vec<_> = self
            .armed
            .lock()
            .expect("timer set poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }
}
