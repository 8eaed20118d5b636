//! One coordinating process: the ownership coordinator, the deferred event
//! scheduler and the activity registry wired to a shared dying flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{error, info};

use crate::activities::ActivityRegistry;
use crate::backends::{BackendError, BackendResult, CoordinationBackend};
use crate::config::{ConfigError, EngineConfig};
use crate::coordinator::{
    DeathNote, OwnershipCoordinator, StartupError, StartupSummary, watch_death_note,
};
use crate::host::ChartRuntime;
use crate::lifecycle::DyingFlag;
use crate::model::{ChartRecord, ChartRef, InstanceId, NewChart};
use crate::scheduler::DeferredEventScheduler;

pub struct Instance<B> {
    backend: B,
    config: EngineConfig,
    dying: DyingFlag,
    coordinator: OwnershipCoordinator<B>,
    scheduler: DeferredEventScheduler<B>,
    activities: ActivityRegistry<B>,
    death_note: Mutex<Option<DeathNote>>,
    shut_down: AtomicBool,
}

impl<B> Instance<B>
where
    B: CoordinationBackend,
{
    /// Wire the components together. Fails on settings that would make a
    /// background loop spin.
    pub fn new(
        backend: B,
        runtime: Arc<dyn ChartRuntime>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dying = DyingFlag::new();
        let coordinator = OwnershipCoordinator::new(
            backend.clone(),
            Arc::clone(&runtime),
            config.instance_id,
            config.startup.clone(),
            dying.clone(),
        );
        let scheduler = DeferredEventScheduler::new(
            backend.clone(),
            Arc::clone(&runtime),
            config.instance_id,
            config.deferred_events.clone(),
            dying.clone(),
        );
        let activities = ActivityRegistry::new(backend.clone(), runtime);
        Ok(Self {
            backend,
            config,
            dying,
            coordinator,
            scheduler,
            activities,
            death_note: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.config.instance_id
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn coordinator(&self) -> &OwnershipCoordinator<B> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &DeferredEventScheduler<B> {
        &self.scheduler
    }

    pub fn activities(&self) -> &ActivityRegistry<B> {
        &self.activities
    }

    pub fn is_dying(&self) -> bool {
        self.dying.is_dying()
    }

    /// Resolves once this instance is dying, by its own shutdown or because
    /// a newer instance overthrew it.
    pub fn dying(&self) -> WaitForCancellationFutureOwned {
        self.dying.wait()
    }

    /// Watch the own row, take ownership of the cluster's charts and start
    /// polling deferred events.
    pub async fn start(&self) -> Result<StartupSummary, StartupError> {
        self.watch_own_death_note();
        let summary = self.coordinator.start().await?;
        self.scheduler.schedule_upcoming().await?;
        info!(
            instance_id = %self.instance_id(),
            adopted = summary.adopted.len(),
            still_paused = summary.still_paused,
            "instance started"
        );
        Ok(summary)
    }

    /// Insert a chart owned by this instance.
    pub async fn insert_chart(&self, chart: &NewChart) -> BackendResult<()> {
        self.backend.insert_chart(self.instance_id(), chart).await
    }

    pub async fn read_chart(&self, chart: &ChartRef) -> BackendResult<Option<ChartRecord>> {
        self.backend.read_chart(chart).await
    }

    /// Mark the own row dying and release everything this instance holds.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned. Later calls are no-ops.
    pub async fn shutdown(&self) -> BackendResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(instance_id = %self.instance_id(), "instance shutting down");

        let mut first_error: Option<BackendError> = None;
        if let Err(err) = self.backend.mark_instance_dying(self.instance_id()).await {
            error!(error = %err, "failed to mark instance dying");
            first_error.get_or_insert(err);
        }
        self.dying.set();
        if let Some(note) = self.death_note.lock().expect("death note poisoned").take() {
            note.cancel();
        }
        if let Err(err) = wind_down(&self.coordinator, &self.scheduler, &self.activities).await {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn watch_own_death_note(&self) {
        let mut slot = self.death_note.lock().expect("death note poisoned");
        if slot.as_ref().is_some_and(DeathNote::is_active) {
            return;
        }
        let dying = self.dying.clone();
        let coordinator = self.coordinator.clone();
        let scheduler = self.scheduler.clone();
        let activities = self.activities.clone();
        let instance_id = self.instance_id();
        *slot = Some(watch_death_note(
            self.backend.clone(),
            instance_id,
            self.config.startup.death_note_interval,
            move || {
                if !dying.set() {
                    return;
                }
                info!(instance_id = %instance_id, "overthrown by another instance; winding down");
                tokio::spawn(async move {
                    if let Err(err) = wind_down(&coordinator, &scheduler, &activities).await {
                        error!(error = %err, "wind down after overthrow failed");
                    }
                });
            },
        ));
    }
}

/// Local half of shutdown: stop adopting, hand deferred events back and
/// stop every activity.
async fn wind_down<B>(
    coordinator: &OwnershipCoordinator<B>,
    scheduler: &DeferredEventScheduler<B>,
    activities: &ActivityRegistry<B>,
) -> BackendResult<()>
where
    B: CoordinationBackend,
{
    coordinator.stop_adoption_loop();
    let released = scheduler.release_all().await;
    if let Err(err) = &released {
        error!(error = %err, "failed to release deferred events");
    }
    activities.stop_all().await;
    released.map(|_| ())
}
