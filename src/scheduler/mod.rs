//! Deferred event scheduler.
//!
//! Polls the store every `interval` for unlocked events due within
//! `look_ahead`, claims up to `batch_size` of them in one statement and arms a
//! local timer per claimed event. A fired timer hands the event to the chart
//! runtime and deletes the row only after the runtime accepted it.

mod timers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendResult, CoordinationBackend};
use crate::config::DeferredEventsConfig;
use crate::host::ChartRuntime;
use crate::lifecycle::DyingFlag;
use crate::model::{
    ChartRef, DeferredEvent, DeferredEventId, InstanceId, NewDeferredEvent, correlation_id,
};

use timers::TimerSet;

/// Schedules and delivers deferred events claimed by one instance.
#[derive(Clone)]
pub struct DeferredEventScheduler<B> {
    inner: Arc<SchedulerInner<B>>,
}

struct SchedulerInner<B> {
    backend: B,
    runtime: Arc<dyn ChartRuntime>,
    instance_id: InstanceId,
    config: DeferredEventsConfig,
    dying: DyingFlag,
    timers: TimerSet,
    /// Claimed events the runtime rejected. Their rows stay locked to us.
    undelivered: Mutex<HashMap<DeferredEventId, DeferredEvent>>,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<B> DeferredEventScheduler<B>
where
    B: CoordinationBackend,
{
    pub fn new(
        backend: B,
        runtime: Arc<dyn ChartRuntime>,
        instance_id: InstanceId,
        config: DeferredEventsConfig,
        dying: DyingFlag,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                backend,
                runtime,
                instance_id,
                config,
                dying,
                timers: TimerSet::default(),
                undelivered: Mutex::new(HashMap::new()),
                poll_loop: Mutex::new(None),
            }),
        }
    }

    /// Persist an event for delivery after `event.delay`.
    ///
    /// Nothing is armed here; the next poll whose window covers the due time
    /// claims it.
    pub async fn defer(&self, event: NewDeferredEvent) -> BackendResult<DeferredEvent> {
        let record = self.inner.backend.defer_event(&event).await?;
        debug!(
            deferred_event_id = %record.id,
            machine_id = %record.chart.machine_id,
            chart_id = %record.chart.chart_id,
            event_id = %record.event_id,
            delay_ms = record.delay_ms,
            "deferred event stored"
        );
        Ok(record)
    }

    /// Run one poll now, then keep polling every `interval` until the
    /// instance is dying.
    pub async fn schedule_upcoming(&self) -> BackendResult<()> {
        self.inner.poll_once().await?;

        let mut poll_loop = self.inner.poll_loop.lock().expect("poll loop poisoned");
        if poll_loop.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        *poll_loop = Some(spawn_poll_loop(
            Arc::downgrade(&self.inner),
            self.inner.dying.clone(),
            self.inner.config.interval,
        ));
        info!(
            instance_id = %self.inner.instance_id,
            interval_ms = self.inner.config.interval.as_millis(),
            look_ahead_ms = self.inner.config.look_ahead.as_millis(),
            batch_size = self.inner.config.batch_size,
            "deferred event polling started"
        );
        Ok(())
    }

    /// Drop `(chart, event_id)` from the store and from the local timers.
    ///
    /// Missing rows are fine: the event may already be delivered, here or
    /// elsewhere.
    pub async fn cancel(&self, chart: &ChartRef, event_id: &str) -> BackendResult<()> {
        let local = self.inner.timers.cancel_matching(chart, event_id);
        {
            let mut undelivered = self.inner.undelivered.lock().expect("undelivered poisoned");
            undelivered.retain(|_, event| !(&event.chart == chart && event.event_id == event_id));
        }
        let deleted = self.inner.backend.cancel_deferred_event(chart, event_id).await?;
        debug!(
            machine_id = %chart.machine_id,
            chart_id = %chart.chart_id,
            event_id,
            local_timers = local.len(),
            deleted,
            "deferred event cancelled"
        );
        Ok(())
    }

    /// Stop polling, abort every local timer and unlock every event this
    /// instance holds so another instance can claim them.
    pub async fn release_all(&self) -> BackendResult<u64> {
        if let Some(handle) = self.inner.poll_loop.lock().expect("poll loop poisoned").take() {
            handle.abort();
        }

        let mut pending = self.inner.timers.cancel_all();
        pending.extend(
            self.inner
                .undelivered
                .lock()
                .expect("undelivered poisoned")
                .drain()
                .map(|(_, event)| event),
        );

        let mut released = 0;
        for event in &pending {
            match self
                .inner
                .backend
                .release_deferred_event(event.id, self.inner.instance_id)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    deferred_event_id = %event.id,
                    event_id = %event.event_id,
                    error = %err,
                    "failed to release deferred event"
                ),
            }
        }
        released += self
            .inner
            .backend
            .release_deferred_events_locked_by(self.inner.instance_id)
            .await?;

        metrics::counter!("chartfleet_deferred_events_released_total").increment(released);
        info!(
            instance_id = %self.inner.instance_id,
            local = pending.len(),
            released,
            "released deferred events"
        );
        Ok(released)
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.timers.len()
    }

    pub fn active_timer_ids(&self) -> Vec<DeferredEventId> {
        self.inner.timers.ids()
    }

    pub fn undelivered_count(&self) -> usize {
        self.inner.undelivered.lock().expect("undelivered poisoned").len()
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poll_loop
            .lock()
            .expect("poll loop poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<B> SchedulerInner<B>
where
    B: CoordinationBackend,
{
    async fn poll_once(self: &Arc<Self>) -> BackendResult<usize> {
        if self.dying.is_dying() {
            return Ok(0);
        }
        let events = self
            .backend
            .take_upcoming_deferred_events(
                self.instance_id,
                self.config.look_ahead,
                self.config.batch_size,
            )
            .await?;
        let claimed = events.len();
        if claimed > 0 {
            metrics::counter!("chartfleet_deferred_events_claimed_total").increment(claimed as u64);
            debug!(instance_id = %self.instance_id, claimed, "claimed deferred events");
        }
        for event in events {
            self.arm(event);
        }
        Ok(claimed)
    }

    fn arm(self: &Arc<Self>, event: DeferredEvent) {
        let id = event.id;
        let delay = event.remaining(Utc::now());
        let inner = Arc::downgrade(self);
        self.timers.arm(event, move || {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = inner.upgrade() {
                    inner.fire(id).await;
                }
            })
            .abort_handle()
        });
    }

    async fn fire(&self, id: DeferredEventId) {
        let Some(event) = self.timers.take(id) else {
            return;
        };
        if self.dying.is_dying() {
            self.release(&event).await;
            return;
        }
        let correlation_id = correlation_id();
        let delivery = self
            .runtime
            .send_event(&event.chart, event.event.clone(), None, &correlation_id)
            .await;

        match delivery {
            Ok(()) => {
                metrics::counter!("chartfleet_deferred_events_delivered_total").increment(1);
                debug!(
                    deferred_event_id = %event.id,
                    machine_id = %event.chart.machine_id,
                    chart_id = %event.chart.chart_id,
                    event_id = %event.event_id,
                    correlation_id = %correlation_id,
                    "delivered deferred event"
                );
                if let Err(err) = self.backend.remove_deferred_event(event.id).await {
                    warn!(
                        deferred_event_id = %event.id,
                        error = %err,
                        "failed to delete delivered deferred event"
                    );
                }
            }
            Err(err) => {
                metrics::counter!("chartfleet_deferred_event_delivery_failures_total").increment(1);
                error!(
                    deferred_event_id = %event.id,
                    machine_id = %event.chart.machine_id,
                    chart_id = %event.chart.chart_id,
                    event_id = %event.event_id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "deferred event delivery failed"
                );
                if self.dying.is_dying() {
                    self.release(&event).await;
                } else {
                    self.undelivered
                        .lock()
                        .expect("undelivered poisoned")
                        .insert(event.id, event);
                }
            }
        }
    }

    async fn release(&self, event: &DeferredEvent) {
        if let Err(err) = self
            .backend
            .release_deferred_event(event.id, self.instance_id)
            .await
        {
            warn!(
                deferred_event_id = %event.id,
                error = %err,
                "failed to release deferred event"
            );
        }
    }
}

fn spawn_poll_loop<B>(
    inner: Weak<SchedulerInner<B>>,
    dying: DyingFlag,
    interval: std::time::Duration,
) -> JoinHandle<()>
where
    B: CoordinationBackend,
{
    tokio::spawn(async move {
        let mut stop = std::pin::pin!(dying.wait());
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("deferred event polling stopped: instance dying");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if dying.is_dying() {
                break;
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if let Err(err) = inner.poll_once().await {
                metrics::counter!("chartfleet_deferred_event_poll_errors_total").increment(1);
                warn!(error = %err, "deferred event poll failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::backends::{DeferredEventBackend, MemoryBackend};
    use crate::test_support::{RecordingRuntime, eventually};

    struct Harness {
        backend: MemoryBackend,
        runtime: Arc<RecordingRuntime>,
        dying: DyingFlag,
        instance_id: InstanceId,
        scheduler: DeferredEventScheduler<MemoryBackend>,
    }

    fn harness(batch_size: usize, look_ahead_ms: u64, interval_ms: u64) -> Harness {
        harness_on(MemoryBackend::new(), batch_size, look_ahead_ms, interval_ms)
    }

    fn harness_on(
        backend: MemoryBackend,
        batch_size: usize,
        look_ahead_ms: u64,
        interval_ms: u64,
    ) -> Harness {
        let runtime = RecordingRuntime::new();
        let dying = DyingFlag::new();
        let instance_id = InstanceId::new();
        let scheduler = DeferredEventScheduler::new(
            backend.clone(),
            runtime.clone(),
            instance_id,
            DeferredEventsConfig {
                batch_size,
                look_ahead: Duration::from_millis(look_ahead_ms),
                interval: Duration::from_millis(interval_ms),
            },
            dying.clone(),
        );
        Harness {
            backend,
            runtime,
            dying,
            instance_id,
            scheduler,
        }
    }

    fn deferred(event_id: &str, delay_ms: u64) -> NewDeferredEvent {
        NewDeferredEvent {
            event_id: event_id.to_string(),
            chart: ChartRef::new("A", "1"),
            event_to: None,
            event: json!({"type": event_id}),
            delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test]
    async fn persists_deferred_events_with_due_after_delay() {
        let h = harness(5, 20, 10);
        let record = h.scheduler.defer(deferred("e", 5)).await.expect("defer");

        assert_eq!(record.delay_ms, 5);
        assert_eq!((record.due - record.timestamp).num_milliseconds(), 5);
        assert_eq!(record.lock, None);
        assert_eq!(h.backend.count_deferred_events().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn delivers_event_inside_look_ahead_and_forgets_it() {
        let h = harness(5, 30, 20);
        h.scheduler.defer(deferred("e", 10)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");
        assert_eq!(h.scheduler.scheduled_count(), 1);

        let runtime = h.runtime.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let runtime = runtime.clone();
                async move { runtime.sent_count() == 1 }
            })
            .await
        );

        let sent = h.runtime.sent();
        assert_eq!(sent[0].chart, ChartRef::new("A", "1"));
        assert_eq!(sent[0].event, json!({"type": "e"}));
        assert_eq!(sent[0].activity_id, None);
        assert!(!sent[0].correlation_id.is_empty());

        let backend = h.backend.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let backend = backend.clone();
                async move { backend.deferred_events().is_empty() }
            })
            .await
        );
        assert_eq!(h.scheduler.scheduled_count(), 0);
        h.dying.set();
    }

    #[tokio::test]
    async fn event_beyond_look_ahead_waits_for_a_later_poll() {
        let h = harness(5, 20, 10);
        h.scheduler.defer(deferred("e", 200)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");

        assert_eq!(h.scheduler.scheduled_count(), 0);
        assert_eq!(h.backend.deferred_events()[0].lock, None);

        let runtime = h.runtime.clone();
        assert!(
            eventually(Duration::from_secs(2), || {
                let runtime = runtime.clone();
                async move { runtime.sent_count() == 1 }
            })
            .await
        );
        h.dying.set();
    }

    #[tokio::test]
    async fn cancel_before_delivery_suppresses_it() {
        let h = harness(5, 1000, 500);
        h.scheduler
            .defer(deferred("eventToBeCanceled", 100))
            .await
            .expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");
        assert_eq!(h.scheduler.scheduled_count(), 1);

        h.scheduler
            .cancel(&ChartRef::new("A", "1"), "eventToBeCanceled")
            .await
            .expect("cancel");
        assert_eq!(h.scheduler.scheduled_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.runtime.sent_count(), 0);
        assert!(h.backend.deferred_events().is_empty());

        h.scheduler
            .cancel(&ChartRef::new("A", "1"), "eventToBeCanceled")
            .await
            .expect("cancelling a missing event is a no-op");
        h.dying.set();
    }

    #[tokio::test]
    async fn release_all_unlocks_claimed_events_for_another_instance() {
        let h = harness(5, 10_000, 5_000);
        h.scheduler.defer(deferred("later", 5_000)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");
        assert_eq!(h.backend.deferred_events()[0].lock, Some(h.instance_id));

        let released = h.scheduler.release_all().await.expect("release");
        assert_eq!(released, 1);
        assert_eq!(h.scheduler.scheduled_count(), 0);
        assert!(!h.scheduler.is_polling());
        assert_eq!(h.backend.deferred_events()[0].lock, None);

        h.scheduler.release_all().await.expect("release again");

        let successor = InstanceId::new();
        let claimed = h
            .backend
            .take_upcoming_deferred_events(successor, Duration::from_millis(10_000), 5)
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].lock, Some(successor));
    }

    #[tokio::test]
    async fn delivery_failure_keeps_the_row_locked_until_release() {
        let h = harness(5, 1000, 500);
        h.runtime.set_failing(true);
        let record = h.scheduler.defer(deferred("e", 0)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");

        let scheduler = h.scheduler.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let scheduler = scheduler.clone();
                async move { scheduler.undelivered_count() == 1 }
            })
            .await
        );
        assert_eq!(h.scheduler.scheduled_count(), 0);
        let row = h
            .backend
            .read_deferred_event(record.id)
            .await
            .expect("read")
            .expect("row kept");
        assert_eq!(row.lock, Some(h.instance_id));

        h.dying.set();
        h.scheduler.release_all().await.expect("release");
        assert_eq!(h.scheduler.undelivered_count(), 0);
        let row = h
            .backend
            .read_deferred_event(record.id)
            .await
            .expect("read")
            .expect("row kept");
        assert_eq!(row.lock, None);
    }

    #[tokio::test]
    async fn polling_stops_once_the_instance_is_dying() {
        let h = harness(5, 20, 10);
        h.scheduler.schedule_upcoming().await.expect("schedule");
        assert!(h.scheduler.is_polling());

        h.dying.set();
        let scheduler = h.scheduler.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let scheduler = scheduler.clone();
                async move { !scheduler.is_polling() }
            })
            .await
        );

        h.scheduler.defer(deferred("e", 0)).await.expect("defer");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.scheduler.scheduled_count(), 0);
        assert_eq!(h.runtime.sent_count(), 0);
    }

    #[tokio::test]
    async fn poll_errors_are_swallowed_and_polling_continues() {
        let h = harness(5, 20, 10);
        h.scheduler.schedule_upcoming().await.expect("schedule");
        h.backend.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(h.scheduler.is_polling());

        h.backend.set_unavailable(false);
        h.scheduler.defer(deferred("e", 0)).await.expect("defer");
        let runtime = h.runtime.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let runtime = runtime.clone();
                async move { runtime.sent_count() == 1 }
            })
            .await
        );
        h.dying.set();
    }

    #[tokio::test]
    async fn a_claimed_batch_is_delivered_in_due_order() {
        let h = harness(10, 1000, 500);
        h.scheduler.defer(deferred("second", 60)).await.expect("defer");
        h.scheduler.defer(deferred("first", 20)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");
        assert_eq!(h.scheduler.active_timer_ids().len(), 2);

        let runtime = h.runtime.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let runtime = runtime.clone();
                async move { runtime.sent_count() == 2 }
            })
            .await
        );
        let order: Vec<_> = h.runtime.sent().into_iter().map(|sent| sent.event).collect();
        assert_eq!(order, vec![json!({"type": "first"}), json!({"type": "second"})]);
        h.dying.set();
    }

    #[tokio::test]
    async fn release_all_leaves_same_named_events_held_by_others_locked() {
        let h = harness(1, 10_000, 5_000);
        h.scheduler.defer(deferred("tick", 5_000)).await.expect("defer");
        h.scheduler.defer(deferred("tick", 5_000)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");
        let other = InstanceId::new();
        let theirs = h
            .backend
            .take_upcoming_deferred_events(other, Duration::from_millis(10_000), 1)
            .await
            .expect("claim");
        assert_eq!(theirs.len(), 1);

        let released = h.scheduler.release_all().await.expect("release");

        assert_eq!(released, 1);
        let row = h
            .backend
            .read_deferred_event(theirs[0].id)
            .await
            .expect("read")
            .expect("row kept");
        assert_eq!(row.lock, Some(other));
        let unlocked = h
            .backend
            .deferred_events()
            .into_iter()
            .filter(|event| event.lock.is_none())
            .count();
        assert_eq!(unlocked, 1);
    }

    #[tokio::test]
    async fn racing_instances_deliver_each_same_named_event_once() {
        let backend = MemoryBackend::new();
        let first = harness_on(backend.clone(), 2, 1000, 500);
        let second = harness_on(backend.clone(), 2, 1000, 500);
        for _ in 0..4 {
            first.scheduler.defer(deferred("tick", 20)).await.expect("defer");
        }

        let (left, right) = tokio::join!(
            first.scheduler.schedule_upcoming(),
            second.scheduler.schedule_upcoming()
        );
        left.expect("first schedule");
        right.expect("second schedule");
        assert_eq!(
            first.scheduler.scheduled_count() + second.scheduler.scheduled_count(),
            4
        );

        let probe = backend.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let probe = probe.clone();
                async move { probe.deferred_events().is_empty() }
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.runtime.sent_count() + second.runtime.sent_count(), 4);
        first.dying.set();
        second.dying.set();
    }

    #[tokio::test]
    async fn timer_firing_while_dying_releases_instead_of_delivering() {
        let h = harness(5, 1000, 500);
        let record = h.scheduler.defer(deferred("e", 30)).await.expect("defer");
        h.scheduler.schedule_upcoming().await.expect("schedule");
        h.dying.set();

        let backend = h.backend.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let backend = backend.clone();
                async move { backend.deferred_events()[0].lock.is_none() }
            })
            .await
        );
        assert_eq!(h.runtime.sent_count(), 0);
        assert_eq!(h.backend.deferred_events()[0].id, record.id);
    }
}
