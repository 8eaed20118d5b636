//! In-memory backend for tests and single-process runs.
//!
//! All tables live behind one mutex so every trait method behaves like a
//! single serializable statement, which is what the coordination protocol
//! relies on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::base::{
    ActivityBackend, BackendError, BackendResult, ChartBackend, DeferredEventBackend,
    InstanceBackend, OverthrowBackend,
};
use crate::model::{
    ChartRecord, ChartRef, DeferredEvent, DeferredEventId, InstanceId, NewChart, NewDeferredEvent,
    duration_millis,
};

type ActivityKey = (ChartRef, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Snapshot of an instance row.
pub struct InstanceRow {
    pub instance_id: InstanceId,
    pub dying: bool,
}

#[derive(Default)]
struct MemoryTables {
    instances: HashMap<InstanceId, bool>,
    charts: BTreeMap<ChartRef, ChartRecord>,
    deferred_events: BTreeMap<DeferredEventId, DeferredEvent>,
    next_deferred_event_id: i64,
    ongoing_activities: BTreeSet<ActivityKey>,
}

impl MemoryTables {
    fn has_ongoing_activity(&self, chart: &ChartRef) -> bool {
        self.ongoing_activities
            .range((chart.clone(), String::new())..)
            .next()
            .is_some_and(|(owner, _)| owner == chart)
    }
}

/// Backend that keeps every table in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<MemoryTables>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the store went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn instances(&self) -> Vec<InstanceRow> {
        let tables = self.tables.lock().expect("memory tables poisoned");
        let mut rows: Vec<_> = tables
            .instances
            .iter()
            .map(|(instance_id, dying)| InstanceRow {
                instance_id: *instance_id,
                dying: *dying,
            })
            .collect();
        rows.sort_by_key(|row| row.instance_id);
        rows
    }

    pub fn charts(&self) -> Vec<ChartRecord> {
        let tables = self.tables.lock().expect("memory tables poisoned");
        tables.charts.values().cloned().collect()
    }

    pub fn deferred_events(&self) -> Vec<DeferredEvent> {
        let tables = self.tables.lock().expect("memory tables poisoned");
        tables.deferred_events.values().cloned().collect()
    }

    pub fn ongoing_activities(&self) -> Vec<(ChartRef, String)> {
        let tables = self.tables.lock().expect("memory tables poisoned");
        tables.ongoing_activities.iter().cloned().collect()
    }

    /// Insert a deferred event with explicit timestamps, bypassing `now`.
    pub fn insert_deferred_event_at(
        &self,
        event: &NewDeferredEvent,
        timestamp: DateTime<Utc>,
    ) -> DeferredEvent {
        let mut tables = self.tables.lock().expect("memory tables poisoned");
        Self::insert_deferred_event(&mut tables, event, timestamp)
    }

    fn tables(&self) -> BackendResult<MutexGuard<'_, MemoryTables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "memory backend switched off".to_string(),
            ));
        }
        Ok(self.tables.lock().expect("memory tables poisoned"))
    }

    fn insert_deferred_event(
        tables: &mut MemoryTables,
        event: &NewDeferredEvent,
        timestamp: DateTime<Utc>,
    ) -> DeferredEvent {
        tables.next_deferred_event_id += 1;
        let delay_ms = duration_millis(event.delay);
        let record = DeferredEvent {
            id: DeferredEventId(tables.next_deferred_event_id),
            chart: event.chart.clone(),
            event_id: event.event_id.clone(),
            event_to: event.event_to.clone(),
            event: event.event.clone(),
            timestamp,
            delay_ms,
            due: timestamp + chrono::Duration::milliseconds(delay_ms),
            lock: None,
        };
        tables.deferred_events.insert(record.id, record.clone());
        record
    }
}

#[async_trait]
impl InstanceBackend for MemoryBackend {
    async fn insert_instance(&self, instance_id: InstanceId) -> BackendResult<()> {
        let mut tables = self.tables()?;
        tables.instances.entry(instance_id).or_insert(false);
        Ok(())
    }

    async fn mark_other_instances_dying(&self, instance_id: InstanceId) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let mut marked = 0;
        for (id, dying) in tables.instances.iter_mut() {
            if *id != instance_id && !*dying {
                *dying = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn mark_instance_dying(&self, instance_id: InstanceId) -> BackendResult<()> {
        let mut tables = self.tables()?;
        if let Some(dying) = tables.instances.get_mut(&instance_id) {
            *dying = true;
        }
        Ok(())
    }

    async fn is_instance_dying(&self, instance_id: InstanceId) -> BackendResult<bool> {
        let tables = self.tables()?;
        Ok(tables.instances.get(&instance_id).copied().unwrap_or(false))
    }

    async fn count_alive_instances(&self) -> BackendResult<i64> {
        let tables = self.tables()?;
        Ok(tables.instances.values().filter(|dying| !**dying).count() as i64)
    }
}

#[async_trait]
impl ChartBackend for MemoryBackend {
    async fn insert_chart(&self, owner_id: InstanceId, chart: &NewChart) -> BackendResult<()> {
        let mut tables = self.tables()?;
        if tables.charts.contains_key(&chart.chart) {
            return Err(BackendError::Message(format!(
                "chart already exists: {}",
                chart.chart
            )));
        }
        tables.charts.insert(
            chart.chart.clone(),
            ChartRecord {
                chart: chart.chart.clone(),
                owner_id,
                parent: chart.parent.clone(),
                state: chart.state.clone(),
                paused: false,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    async fn read_chart(&self, chart: &ChartRef) -> BackendResult<Option<ChartRecord>> {
        let tables = self.tables()?;
        Ok(tables.charts.get(chart).cloned())
    }

    async fn update_chart_state(&self, chart: &ChartRef, state: &Value) -> BackendResult<bool> {
        let mut tables = self.tables()?;
        match tables.charts.get_mut(chart) {
            Some(record) => {
                record.state = state.clone();
                record.timestamp = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn destroy_chart(&self, chart: &ChartRef) -> BackendResult<bool> {
        let mut tables = self.tables()?;
        let removed = tables.charts.remove(chart).is_some();
        tables
            .deferred_events
            .retain(|_, event| &event.chart != chart);
        tables
            .ongoing_activities
            .retain(|(owner, _)| owner != chart);
        Ok(removed)
    }

    async fn count_own_charts(&self, owner_id: InstanceId) -> BackendResult<i64> {
        let tables = self.tables()?;
        Ok(tables
            .charts
            .values()
            .filter(|record| record.owner_id == owner_id)
            .count() as i64)
    }

    async fn mark_all_charts_paused(&self) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let mut paused = 0;
        for record in tables.charts.values_mut() {
            record.paused = true;
            paused += 1;
        }
        Ok(paused)
    }

    async fn count_paused_charts(&self) -> BackendResult<i64> {
        let tables = self.tables()?;
        Ok(tables.charts.values().filter(|record| record.paused).count() as i64)
    }

    async fn pause_owned_charts(
        &self,
        owner_id: InstanceId,
        charts: &[ChartRef],
    ) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let mut paused = 0;
        for chart in charts {
            if let Some(record) = tables.charts.get_mut(chart)
                && record.owner_id == owner_id
                && !record.paused
            {
                record.paused = true;
                paused += 1;
            }
        }
        Ok(paused)
    }

    async fn get_paused_chart_ids(&self) -> BackendResult<Vec<ChartRef>> {
        let tables = self.tables()?;
        Ok(tables
            .charts
            .values()
            .filter(|record| record.paused)
            .map(|record| record.chart.clone())
            .collect())
    }

    async fn get_paused_charts_with_no_ongoing_activities(&self) -> BackendResult<Vec<ChartRef>> {
        let tables = self.tables()?;
        Ok(tables
            .charts
            .values()
            .filter(|record| record.paused && !tables.has_ongoing_activity(&record.chart))
            .map(|record| record.chart.clone())
            .collect())
    }

    async fn change_owner_and_resume_charts(
        &self,
        owner_id: InstanceId,
        charts: &[ChartRef],
    ) -> BackendResult<Vec<ChartRef>> {
        let mut tables = self.tables()?;
        let mut adopted = Vec::new();
        for chart in charts {
            if tables.has_ongoing_activity(chart) {
                continue;
            }
            if let Some(record) = tables.charts.get_mut(chart)
                && record.paused
            {
                record.paused = false;
                record.owner_id = owner_id;
                adopted.push(chart.clone());
            }
        }
        Ok(adopted)
    }
}

#[async_trait]
impl OverthrowBackend for MemoryBackend {
    async fn overthrow_other_instances(&self, instance_id: InstanceId) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let mut overthrown = 0;
        for (id, dying) in tables.instances.iter_mut() {
            if *id != instance_id && !*dying {
                *dying = true;
                overthrown += 1;
            }
        }
        for record in tables.charts.values_mut() {
            record.paused = true;
        }
        for event in tables.deferred_events.values_mut() {
            if event.lock.is_some_and(|owner| owner != instance_id) {
                event.lock = None;
            }
        }
        Ok(overthrown)
    }
}

#[async_trait]
impl DeferredEventBackend for MemoryBackend {
    async fn defer_event(&self, event: &NewDeferredEvent) -> BackendResult<DeferredEvent> {
        let mut tables = self.tables()?;
        Ok(Self::insert_deferred_event(&mut tables, event, Utc::now()))
    }

    async fn take_upcoming_deferred_events(
        &self,
        instance_id: InstanceId,
        look_ahead: Duration,
        batch_size: usize,
    ) -> BackendResult<Vec<DeferredEvent>> {
        let mut tables = self.tables()?;
        let horizon = Utc::now() + chrono::Duration::milliseconds(duration_millis(look_ahead));
        let mut candidates: Vec<(DateTime<Utc>, DeferredEventId)> = tables
            .deferred_events
            .values()
            .filter(|event| event.lock.is_none() && event.due < horizon)
            .map(|event| (event.due, event.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(event) = tables.deferred_events.get_mut(&id) {
                event.lock = Some(instance_id);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn remove_deferred_event(&self, id: DeferredEventId) -> BackendResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables.deferred_events.remove(&id).is_some())
    }

    async fn cancel_deferred_event(&self, chart: &ChartRef, event_id: &str) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let before = tables.deferred_events.len();
        tables
            .deferred_events
            .retain(|_, event| !(&event.chart == chart && event.event_id == event_id));
        Ok((before - tables.deferred_events.len()) as u64)
    }

    async fn release_deferred_event(
        &self,
        id: DeferredEventId,
        instance_id: InstanceId,
    ) -> BackendResult<bool> {
        let mut tables = self.tables()?;
        match tables.deferred_events.get_mut(&id) {
            Some(event) if event.lock == Some(instance_id) => {
                event.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_deferred_events_locked_by(
        &self,
        instance_id: InstanceId,
    ) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let mut released = 0;
        for event in tables.deferred_events.values_mut() {
            if event.lock == Some(instance_id) {
                event.lock = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_deferred_events_not_locked_by(
        &self,
        instance_id: InstanceId,
    ) -> BackendResult<u64> {
        let mut tables = self.tables()?;
        let mut released = 0;
        for event in tables.deferred_events.values_mut() {
            if event.lock.is_some_and(|owner| owner != instance_id) {
                event.lock = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn read_deferred_event(
        &self,
        id: DeferredEventId,
    ) -> BackendResult<Option<DeferredEvent>> {
        let tables = self.tables()?;
        Ok(tables.deferred_events.get(&id).cloned())
    }

    async fn count_deferred_events(&self) -> BackendResult<i64> {
        let tables = self.tables()?;
        Ok(tables.deferred_events.len() as i64)
    }
}

#[async_trait]
impl ActivityBackend for MemoryBackend {
    async fn register_activity(&self, chart: &ChartRef, activity_id: &str) -> BackendResult<()> {
        let mut tables = self.tables()?;
        tables
            .ongoing_activities
            .insert((chart.clone(), activity_id.to_string()));
        Ok(())
    }

    async fn unregister_activity(&self, chart: &ChartRef, activity_id: &str) -> BackendResult<()> {
        let mut tables = self.tables()?;
        tables
            .ongoing_activities
            .remove(&(chart.clone(), activity_id.to_string()));
        Ok(())
    }

    async fn is_activity_registered(
        &self,
        chart: &ChartRef,
        activity_id: &str,
    ) -> BackendResult<bool> {
        let tables = self.tables()?;
        Ok(tables
            .ongoing_activities
            .contains(&(chart.clone(), activity_id.to_string())))
    }
}
