//! Store interfaces shared by the coordinator, scheduler and activity registry.
//!
//! Every method that other instances may race on is a single atomic
//! statement (or one transaction) in the backing store. Callers never split
//! a claim into a read followed by a separate write.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{
    ChartRecord, ChartRef, DeferredEvent, DeferredEventId, InstanceId, NewChart, NewDeferredEvent,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Instance rows: liveness of every process that ever joined the cluster.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Insert this instance as alive. Re-inserting an existing id is a no-op.
    async fn insert_instance(&self, instance_id: InstanceId) -> BackendResult<()>;

    /// Flag every instance except `instance_id` as dying.
    async fn mark_other_instances_dying(&self, instance_id: InstanceId) -> BackendResult<u64>;

    /// Flag a single instance as dying (own shutdown).
    async fn mark_instance_dying(&self, instance_id: InstanceId) -> BackendResult<()>;

    async fn is_instance_dying(&self, instance_id: InstanceId) -> BackendResult<bool>;

    async fn count_alive_instances(&self) -> BackendResult<i64>;
}

/// Chart rows and the ownership columns the coordinator manages.
#[async_trait]
pub trait ChartBackend: Send + Sync {
    async fn insert_chart(&self, owner_id: InstanceId, chart: &NewChart) -> BackendResult<()>;

    async fn read_chart(&self, chart: &ChartRef) -> BackendResult<Option<ChartRecord>>;

    /// Replace the snapshot of a chart. Never touches `owner_id` or `paused`.
    async fn update_chart_state(&self, chart: &ChartRef, state: &Value) -> BackendResult<bool>;

    /// Delete a chart along with its deferred events and ongoing-activity rows.
    async fn destroy_chart(&self, chart: &ChartRef) -> BackendResult<bool>;

    async fn count_own_charts(&self, owner_id: InstanceId) -> BackendResult<i64>;

    async fn mark_all_charts_paused(&self) -> BackendResult<u64>;

    async fn count_paused_charts(&self) -> BackendResult<i64>;

    /// Pause the given charts again if `owner_id` still owns them. Used when
    /// adopted charts could not be resumed.
    async fn pause_owned_charts(&self, owner_id: InstanceId, charts: &[ChartRef])
    -> BackendResult<u64>;

    async fn get_paused_chart_ids(&self) -> BackendResult<Vec<ChartRef>>;

    /// Paused charts with no ongoing-activity rows: the only ones safe to adopt.
    async fn get_paused_charts_with_no_ongoing_activities(&self) -> BackendResult<Vec<ChartRef>>;

    /// Hand the given charts to `owner_id` and unpause them in one statement.
    ///
    /// Only charts that are still paused and still free of ongoing
    /// activities are taken; the returned list is what was actually adopted.
    async fn change_owner_and_resume_charts(
        &self,
        owner_id: InstanceId,
        charts: &[ChartRef],
    ) -> BackendResult<Vec<ChartRef>>;
}

/// Persisted deferred events and their delivery locks.
#[async_trait]
pub trait DeferredEventBackend: Send + Sync {
    /// Insert an unlocked event due at `now + delay`.
    async fn defer_event(&self, event: &NewDeferredEvent) -> BackendResult<DeferredEvent>;

    /// Claim up to `batch_size` unlocked events due before `now + look_ahead`,
    /// ordered by `(due, id)`, locking them to `instance_id` in the same
    /// statement.
    async fn take_upcoming_deferred_events(
        &self,
        instance_id: InstanceId,
        look_ahead: Duration,
        batch_size: usize,
    ) -> BackendResult<Vec<DeferredEvent>>;

    /// Delete one event by row id. Missing rows are not an error.
    async fn remove_deferred_event(&self, id: DeferredEventId) -> BackendResult<bool>;

    /// Delete every row for `(chart, event_id)` regardless of its lock.
    async fn cancel_deferred_event(&self, chart: &ChartRef, event_id: &str) -> BackendResult<u64>;

    /// Clear the lock on row `id` if `instance_id` still holds it.
    async fn release_deferred_event(
        &self,
        id: DeferredEventId,
        instance_id: InstanceId,
    ) -> BackendResult<bool>;

    /// Clear every lock held by `instance_id`.
    async fn release_deferred_events_locked_by(&self, instance_id: InstanceId)
    -> BackendResult<u64>;

    /// Clear every lock held by anyone other than `instance_id`.
    async fn release_deferred_events_not_locked_by(&self, instance_id: InstanceId)
    -> BackendResult<u64>;

    async fn read_deferred_event(&self, id: DeferredEventId)
    -> BackendResult<Option<DeferredEvent>>;

    async fn count_deferred_events(&self) -> BackendResult<i64>;
}

/// Store mirror of the activities running on behalf of charts.
#[async_trait]
pub trait ActivityBackend: Send + Sync {
    /// Insert the mirror row. A conflicting insert is a no-op.
    async fn register_activity(&self, chart: &ChartRef, activity_id: &str) -> BackendResult<()>;

    /// Delete the mirror row. Missing rows are not an error.
    async fn unregister_activity(&self, chart: &ChartRef, activity_id: &str) -> BackendResult<()>;

    async fn is_activity_registered(&self, chart: &ChartRef, activity_id: &str)
    -> BackendResult<bool>;
}

/// Instance-level startup step: pause the whole cluster around a takeover.
#[async_trait]
pub trait OverthrowBackend: InstanceBackend + ChartBackend + DeferredEventBackend {
    /// Mark every other instance dying, every chart paused and every
    /// deferred event claimed by another instance unlocked.
    ///
    /// Backends with transactions override this to apply all three in one.
    async fn overthrow_other_instances(&self, instance_id: InstanceId) -> BackendResult<u64> {
        let overthrown = self.mark_other_instances_dying(instance_id).await?;
        self.mark_all_charts_paused().await?;
        self.release_deferred_events_not_locked_by(instance_id).await?;
        Ok(overthrown)
    }
}

/// Everything one instance needs from the shared store.
pub trait CoordinationBackend:
    OverthrowBackend + DeferredEventBackend + ActivityBackend + Clone + Send + Sync + 'static
{
}

impl<T> CoordinationBackend for T where
    T: OverthrowBackend + DeferredEventBackend + ActivityBackend + Clone + Send + Sync + 'static
{
}
