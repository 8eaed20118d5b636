//! Activity registry.
//!
//! Keeps the in-memory handles of activities running for charts this
//! instance owns, together with their `ongoing_activities` mirror rows. The
//! mirror row is written before the handle is kept and deleted only after
//! the activity is stopped, so a crash can leave a stale row (adoption stays
//! blocked) but never a live activity without one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backends::{BackendResult, CoordinationBackend};
use crate::host::{Activity, ActivityError, ChartRuntime};
use crate::model::{ChartRef, correlation_id};

type ActivityKey = (ChartRef, String);

struct RegisteredActivity {
    activity: Arc<dyn Activity>,
    relay: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ActivityRegistry<B> {
    backend: B,
    runtime: Arc<dyn ChartRuntime>,
    activities: Arc<Mutex<HashMap<ActivityKey, RegisteredActivity>>>,
}

impl<B> ActivityRegistry<B>
where
    B: CoordinationBackend,
{
    pub fn new(backend: B, runtime: Arc<dyn ChartRuntime>) -> Self {
        Self {
            backend,
            runtime,
            activities: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mirror the activity in the store, then keep its handle and relay
    /// everything it emits to its owning chart.
    ///
    /// A failed mirror write leaves nothing registered.
    pub async fn register_activity(&self, activity: Arc<dyn Activity>) -> BackendResult<()> {
        let owner = activity.owner().clone();
        let activity_id = activity.id().to_string();
        self.backend.register_activity(&owner, &activity_id).await?;

        let relay = spawn_relay(
            Arc::clone(&self.runtime),
            owner.clone(),
            activity_id.clone(),
            activity.subscribe(),
        );
        let previous = self
            .activities
            .lock()
            .expect("activities poisoned")
            .insert(
                (owner.clone(), activity_id.clone()),
                RegisteredActivity { activity, relay },
            );
        if let Some(previous) = previous {
            previous.relay.abort();
        }
        info!(
            machine_id = %owner.machine_id,
            chart_id = %owner.chart_id,
            activity_id = %activity_id,
            "activity registered"
        );
        Ok(())
    }

    /// Tear down one activity: stop relaying, stop it, delete its mirror row
    /// and drop the handle. Every step runs even when an earlier one fails.
    pub async fn stop_and_unregistered_activity(&self, activity: &dyn Activity) {
        let owner = activity.owner().clone();
        let activity_id = activity.id().to_string();
        let registered = self
            .activities
            .lock()
            .expect("activities poisoned")
            .remove(&(owner.clone(), activity_id.clone()));
        match registered {
            Some(registered) => self.teardown(&owner, &activity_id, registered).await,
            None => self.unregister_row(&owner, &activity_id).await,
        }
    }

    /// Forward `event` to a local activity. Activities not held here are
    /// ignored: after a handover they may legitimately run elsewhere.
    pub async fn send_to(
        &self,
        chart: &ChartRef,
        activity_id: &str,
        event: Value,
    ) -> Result<(), ActivityError> {
        let activity = self
            .activities
            .lock()
            .expect("activities poisoned")
            .get(&(chart.clone(), activity_id.to_string()))
            .map(|registered| Arc::clone(&registered.activity));
        match activity {
            Some(activity) => activity.send(event).await,
            None => {
                debug!(
                    machine_id = %chart.machine_id,
                    chart_id = %chart.chart_id,
                    activity_id,
                    "no local activity to send to"
                );
                Ok(())
            }
        }
    }

    /// Tear down every registered activity. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(ActivityKey, RegisteredActivity)> = self
            .activities
            .lock()
            .expect("activities poisoned")
            .drain()
            .collect();
        let count = drained.len();
        for ((owner, activity_id), registered) in drained {
            self.teardown(&owner, &activity_id, registered).await;
        }
        if count > 0 {
            info!(count, "stopped all activities");
        }
        count
    }

    pub fn activity_count(&self) -> usize {
        self.activities.lock().expect("activities poisoned").len()
    }

    pub fn has(&self, chart: &ChartRef, activity_id: &str) -> bool {
        self.activities
            .lock()
            .expect("activities poisoned")
            .contains_key(&(chart.clone(), activity_id.to_string()))
    }

    async fn teardown(&self, owner: &ChartRef, activity_id: &str, registered: RegisteredActivity) {
        registered.relay.abort();
        if let Err(err) = registered.activity.stop().await {
            warn!(
                machine_id = %owner.machine_id,
                chart_id = %owner.chart_id,
                activity_id,
                error = %err,
                "activity stop hook failed"
            );
        }
        self.unregister_row(owner, activity_id).await;
        info!(
            machine_id = %owner.machine_id,
            chart_id = %owner.chart_id,
            activity_id,
            "activity unregistered"
        );
    }

    async fn unregister_row(&self, owner: &ChartRef, activity_id: &str) {
        if let Err(err) = self.backend.unregister_activity(owner, activity_id).await {
            warn!(
                machine_id = %owner.machine_id,
                chart_id = %owner.chart_id,
                activity_id,
                error = %err,
                "failed to delete ongoing activity row"
            );
        }
    }
}

fn spawn_relay(
    runtime: Arc<dyn ChartRuntime>,
    owner: ChartRef,
    activity_id: String,
    mut events: tokio::sync::mpsc::UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let correlation_id = correlation_id();
            if let Err(err) = runtime
                .send_event(&owner, event, Some(&activity_id), &correlation_id)
                .await
            {
                warn!(
                    machine_id = %owner.machine_id,
                    chart_id = %owner.chart_id,
                    activity_id = %activity_id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "failed to relay activity event"
                );
            }
        }
    })
}
