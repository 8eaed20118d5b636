//! Startup ownership protocol.
//!
//! Register, overthrow the rest of the cluster, wait out the grace period,
//! adopt every paused chart with no ongoing activity, then keep retrying
//! adoption for the leftovers until none remain or this instance is dying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backends::{BackendError, CoordinationBackend};
use crate::config::StartupConfig;
use crate::host::{ChartRuntime, DeliveryError};
use crate::lifecycle::DyingFlag;
use crate::model::{ChartRef, InstanceId};

/// Fatal startup failure. The instance never became ready.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("store error during startup: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to resume adopted charts: {0}")]
    Resume(#[from] DeliveryError),
    #[error("instance started dying during startup")]
    Dying,
}

/// What one startup sequence did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupSummary {
    /// Instances that were alive, this one included, before the overthrow.
    pub alive_instances: i64,
    pub overthrown: u64,
    pub adopted: Vec<ChartRef>,
    /// Charts left paused behind ongoing activities.
    pub still_paused: i64,
}

#[derive(Clone)]
pub struct OwnershipCoordinator<B> {
    inner: Arc<CoordinatorInner<B>>,
}

struct CoordinatorInner<B> {
    backend: B,
    runtime: Arc<dyn ChartRuntime>,
    instance_id: InstanceId,
    config: StartupConfig,
    dying: DyingFlag,
    started: AtomicBool,
    ready: AtomicBool,
    adoption_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<B> OwnershipCoordinator<B>
where
    B: CoordinationBackend,
{
    pub fn new(
        backend: B,
        runtime: Arc<dyn ChartRuntime>,
        instance_id: InstanceId,
        config: StartupConfig,
        dying: DyingFlag,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                backend,
                runtime,
                instance_id,
                config,
                dying,
                started: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                adoption_loop: Mutex::new(None),
            }),
        }
    }

    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// Run the whole startup sequence. Any store failure aborts it and the
    /// instance stays not ready.
    pub async fn start(&self) -> Result<StartupSummary, StartupError> {
        let inner = &self.inner;
        self.stop_adoption_loop();
        inner.started.store(true, Ordering::SeqCst);
        inner.ready.store(false, Ordering::SeqCst);

        inner.backend.insert_instance(inner.instance_id).await?;
        let alive_instances = inner.backend.count_alive_instances().await?;
        let overthrown = inner
            .backend
            .overthrow_other_instances(inner.instance_id)
            .await?;
        info!(
            instance_id = %inner.instance_id,
            alive_instances,
            overthrown,
            "overthrew other instances and paused all charts"
        );

        if inner.backend.count_paused_charts().await? > 0 {
            inner.wait_grace_period().await?;
        }

        let adopted = inner.adopt_charts().await?;
        inner.resume_adopted(&adopted).await?;
        let still_paused = inner.backend.count_paused_charts().await?;

        if still_paused > 0 {
            let handle = spawn_adoption_loop(Arc::clone(inner));
            *inner.adoption_loop.lock().expect("adoption loop poisoned") = Some(handle);
        }
        inner.ready.store(true, Ordering::SeqCst);
        info!(
            instance_id = %inner.instance_id,
            adopted = adopted.len(),
            still_paused,
            "instance ready"
        );

        Ok(StartupSummary {
            alive_instances,
            overthrown,
            adopted,
            still_paused,
        })
    }

    /// `true` while leftover charts are still being retried.
    pub fn is_adopting(&self) -> bool {
        self.inner
            .adoption_loop
            .lock()
            .expect("adoption loop poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop_adoption_loop(&self) {
        if let Some(handle) = self
            .inner
            .adoption_loop
            .lock()
            .expect("adoption loop poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl<B> CoordinatorInner<B>
where
    B: CoordinationBackend,
{
    async fn wait_grace_period(&self) -> Result<(), StartupError> {
        debug!(
            instance_id = %self.instance_id,
            grace_period_ms = self.config.grace_period.as_millis(),
            "waiting for previous owners to wind down"
        );
        tokio::select! {
            _ = self.dying.wait() => Err(StartupError::Dying),
            _ = tokio::time::sleep(self.config.grace_period) => Ok(()),
        }
    }

    /// Take every paused chart that has no ongoing activity.
    async fn adopt_charts(&self) -> Result<Vec<ChartRef>, BackendError> {
        let candidates = self
            .backend
            .get_paused_charts_with_no_ongoing_activities()
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let adopted = self
            .backend
            .change_owner_and_resume_charts(self.instance_id, &candidates)
            .await?;
        if !adopted.is_empty() {
            metrics::counter!("chartfleet_charts_adopted_total").increment(adopted.len() as u64);
            info!(
                instance_id = %self.instance_id,
                adopted = adopted.len(),
                candidates = candidates.len(),
                "adopted charts"
            );
        }
        Ok(adopted)
    }

    /// Hand adopted charts to the runtime. On failure they go back to
    /// paused so a later adoption pass picks them up again.
    async fn resume_adopted(&self, adopted: &[ChartRef]) -> Result<(), StartupError> {
        if adopted.is_empty() {
            return Ok(());
        }
        let Err(err) = self.runtime.resume_charts(adopted).await else {
            return Ok(());
        };
        warn!(
            instance_id = %self.instance_id,
            charts = adopted.len(),
            error = %err,
            "failed to resume adopted charts; pausing them again"
        );
        if let Err(pause_err) = self
            .backend
            .pause_owned_charts(self.instance_id, adopted)
            .await
        {
            warn!(
                instance_id = %self.instance_id,
                error = %pause_err,
                "failed to pause charts that could not be resumed"
            );
        }
        Err(StartupError::Resume(err))
    }

    /// One retry tick. Returns `true` once nothing is left to adopt.
    async fn retry_adoption(&self) -> Result<bool, StartupError> {
        let paused = self.backend.get_paused_chart_ids().await?;
        if paused.is_empty() {
            return Ok(true);
        }
        let adopted = self.adopt_charts().await?;
        self.resume_adopted(&adopted).await?;
        debug!(
            instance_id = %self.instance_id,
            paused = paused.len(),
            adopted = adopted.len(),
            "adoption retry tick"
        );
        Ok(paused.len() == adopted.len())
    }
}

fn spawn_adoption_loop<B>(inner: Arc<CoordinatorInner<B>>) -> JoinHandle<()>
where
    B: CoordinationBackend,
{
    tokio::spawn(async move {
        let mut stop = std::pin::pin!(inner.dying.wait());
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!(instance_id = %inner.instance_id, "adoption loop stopped: instance dying");
                    break;
                }
                _ = tokio::time::sleep(inner.config.adoption_frequency) => {}
            }
            if inner.dying.is_dying() {
                break;
            }
            match inner.retry_adoption().await {
                Ok(true) => {
                    info!(instance_id = %inner.instance_id, "no paused charts left to adopt");
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    metrics::counter!("chartfleet_adoption_errors_total").increment(1);
                    warn!(instance_id = %inner.instance_id, error = %err, "adoption retry failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::backends::{ActivityBackend, ChartBackend, InstanceBackend, MemoryBackend};
    use crate::model::NewChart;
    use crate::test_support::{RecordingRuntime, eventually};

    fn startup_config() -> StartupConfig {
        StartupConfig {
            grace_period: Duration::from_millis(75),
            adoption_frequency: Duration::from_millis(20),
            death_note_interval: Duration::from_millis(10),
        }
    }

    fn coordinator(
        backend: &MemoryBackend,
        runtime: &Arc<RecordingRuntime>,
        dying: &DyingFlag,
    ) -> OwnershipCoordinator<MemoryBackend> {
        OwnershipCoordinator::new(
            backend.clone(),
            runtime.clone(),
            InstanceId::new(),
            startup_config(),
            dying.clone(),
        )
    }

    async fn seed_charts(backend: &MemoryBackend, owner: InstanceId, count: usize) -> Vec<ChartRef> {
        let mut charts = Vec::new();
        for index in 0..count {
            let chart = ChartRef::new("machine", format!("chart-{index:02}"));
            backend
                .insert_chart(
                    owner,
                    &NewChart {
                        chart: chart.clone(),
                        parent: None,
                        state: json!({"value": "idle"}),
                    },
                )
                .await
                .expect("insert chart");
            charts.push(chart);
        }
        charts
    }

    #[tokio::test]
    async fn is_initially_neither_started_nor_ready() {
        let backend = MemoryBackend::new();
        let coordinator = coordinator(&backend, &RecordingRuntime::new(), &DyingFlag::new());
        assert!(!coordinator.started());
        assert!(!coordinator.ready());
    }

    #[tokio::test]
    async fn becomes_ready_immediately_when_nothing_to_adopt() {
        let backend = MemoryBackend::new();
        let coordinator = coordinator(&backend, &RecordingRuntime::new(), &DyingFlag::new());

        let started_at = tokio::time::Instant::now();
        let summary = coordinator.start().await.expect("start");

        assert!(started_at.elapsed() < Duration::from_millis(75));
        assert!(coordinator.started());
        assert!(coordinator.ready());
        assert!(summary.adopted.is_empty());
        assert!(!coordinator.is_adopting());
    }

    #[tokio::test]
    async fn overthrows_and_adopts_every_idle_chart_after_the_grace_period() {
        let backend = MemoryBackend::new();
        let previous = InstanceId::new();
        backend.insert_instance(previous).await.expect("insert previous");
        let charts = seed_charts(&backend, previous, 5).await;
        let runtime = RecordingRuntime::new();
        let coordinator = coordinator(&backend, &runtime, &DyingFlag::new());

        let started_at = tokio::time::Instant::now();
        let summary = coordinator.start().await.expect("start");

        assert!(started_at.elapsed() >= Duration::from_millis(75));
        assert_eq!(summary.alive_instances, 2);
        assert_eq!(summary.overthrown, 1);
        assert_eq!(summary.adopted, charts);
        assert_eq!(summary.still_paused, 0);
        assert!(backend.is_instance_dying(previous).await.expect("dying"));
        for record in backend.charts() {
            assert!(!record.paused);
            assert_eq!(record.owner_id, coordinator.instance_id());
        }
        assert_eq!(runtime.resumed(), charts);
    }

    #[tokio::test]
    async fn charts_with_ongoing_activities_wait_for_the_retry_loop() {
        let backend = MemoryBackend::new();
        let previous = InstanceId::new();
        let charts = seed_charts(&backend, previous, 3).await;
        backend
            .register_activity(&charts[1], "poller")
            .await
            .expect("register activity");
        let runtime = RecordingRuntime::new();
        let dying = DyingFlag::new();
        let coordinator = coordinator(&backend, &runtime, &dying);

        let summary = coordinator.start().await.expect("start");

        assert!(coordinator.ready());
        assert_eq!(summary.adopted, vec![charts[0].clone(), charts[2].clone()]);
        assert_eq!(summary.still_paused, 1);
        assert!(coordinator.is_adopting());
        let busy = backend
            .read_chart(&charts[1])
            .await
            .expect("read")
            .expect("chart exists");
        assert!(busy.paused);
        assert_eq!(busy.owner_id, previous);

        backend
            .unregister_activity(&charts[1], "poller")
            .await
            .expect("unregister");
        let probe = backend.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let probe = probe.clone();
                async move { probe.count_paused_charts().await.expect("count") == 0 }
            })
            .await
        );
        let adopter = coordinator.inner.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                let adopter = adopter.clone();
                async move {
                    adopter
                        .adoption_loop
                        .lock()
                        .expect("adoption loop poisoned")
                        .as_ref()
                        .is_some_and(|handle| handle.is_finished())
                }
            })
            .await
        );
        assert_eq!(runtime.resumed().len(), 3);
    }

    #[tokio::test]
    async fn retry_loop_stops_when_the_instance_is_dying() {
        let backend = MemoryBackend::new();
        let charts = seed_charts(&backend, InstanceId::new(), 1).await;
        backend
            .register_activity(&charts[0], "poller")
            .await
            .expect("register activity");
        let dying = DyingFlag::new();
        let coordinator = coordinator(&backend, &RecordingRuntime::new(), &dying);
        coordinator.start().await.expect("start");
        assert!(coordinator.is_adopting());

        dying.set();

        let probe = &coordinator;
        assert!(
            eventually(Duration::from_secs(1), || async move { !probe.is_adopting() }).await
        );
    }

    #[tokio::test]
    async fn retry_loop_swallows_store_errors() {
        let backend = MemoryBackend::new();
        let charts = seed_charts(&backend, InstanceId::new(), 1).await;
        backend
            .register_activity(&charts[0], "poller")
            .await
            .expect("register activity");
        let dying = DyingFlag::new();
        let coordinator = coordinator(&backend, &RecordingRuntime::new(), &dying);
        coordinator.start().await.expect("start");

        backend.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(coordinator.is_adopting());

        backend.set_unavailable(false);
        backend
            .unregister_activity(&charts[0], "poller")
            .await
            .expect("unregister");
        let probe = &coordinator;
        assert!(
            eventually(Duration::from_secs(1), || async move { !probe.is_adopting() }).await
        );
        assert_eq!(backend.count_paused_charts().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn store_failure_aborts_startup() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        let coordinator = coordinator(&backend, &RecordingRuntime::new(), &DyingFlag::new());

        let err = coordinator.start().await.expect_err("startup fails");

        assert!(matches!(err, StartupError::Backend(BackendError::Unavailable(_))));
        assert!(coordinator.started());
        assert!(!coordinator.ready());
    }

    #[tokio::test]
    async fn dying_during_the_grace_period_aborts_startup() {
        let backend = MemoryBackend::new();
        seed_charts(&backend, InstanceId::new(), 1).await;
        let dying = DyingFlag::new();
        let coordinator = coordinator(&backend, &RecordingRuntime::new(), &dying);

        let flag = dying.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.set();
        });
        let err = coordinator.start().await.expect_err("startup aborted");

        assert!(matches!(err, StartupError::Dying));
        assert!(!coordinator.ready());
    }

    #[tokio::test]
    async fn resume_failure_pauses_adopted_charts_and_aborts_startup() {
        let backend = MemoryBackend::new();
        seed_charts(&backend, InstanceId::new(), 2).await;
        let runtime = RecordingRuntime::new();
        runtime.set_failing_resume(true);
        let coordinator = coordinator(&backend, &runtime, &DyingFlag::new());

        let err = coordinator.start().await.expect_err("startup fails");

        assert!(matches!(err, StartupError::Resume(_)));
        assert!(!coordinator.ready());
        assert!(!coordinator.is_adopting());
        assert_eq!(backend.count_paused_charts().await.expect("count"), 2);
        assert!(runtime.resumed().is_empty());
    }

    #[tokio::test]
    async fn retry_loop_pauses_again_when_resume_fails_and_retries() {
        let backend = MemoryBackend::new();
        let charts = seed_charts(&backend, InstanceId::new(), 1).await;
        backend
            .register_activity(&charts[0], "poller")
            .await
            .expect("register activity");
        let runtime = RecordingRuntime::new();
        let coordinator = coordinator(&backend, &runtime, &DyingFlag::new());
        coordinator.start().await.expect("start");

        runtime.set_failing_resume(true);
        backend
            .unregister_activity(&charts[0], "poller")
            .await
            .expect("unregister");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(coordinator.is_adopting());
        assert_eq!(backend.count_paused_charts().await.expect("count"), 1);

        runtime.set_failing_resume(false);
        let probe = &coordinator;
        assert!(
            eventually(Duration::from_secs(1), || async move { !probe.is_adopting() }).await
        );
        assert_eq!(backend.count_paused_charts().await.expect("count"), 0);
        assert_eq!(runtime.resumed(), charts);
    }
}
