//! Seams to the host orchestrator: the chart runtime events are routed into,
//! and the long-running activities charts start.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::backends::BackendError;
use crate::model::ChartRef;

/// Returned by the host when an event cannot be applied to a chart.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("chart not found: {0}")]
    ChartNotFound(ChartRef),
    #[error("chart {chart} rejected event: {reason}")]
    Rejected { chart: ChartRef, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Returned by activity hooks.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("activity {0} already stopped")]
    Stopped(String),
    #[error("{0}")]
    Failed(String),
}

/// Routes events into the chart runtime.
#[async_trait]
pub trait ChartRuntime: Send + Sync + 'static {
    /// Deliver `event` to `chart`. `activity_id` is set when the event was
    /// produced by one of the chart's activities.
    async fn send_event(
        &self,
        chart: &ChartRef,
        event: Value,
        activity_id: Option<&str>,
        correlation_id: &str,
    ) -> Result<(), DeliveryError>;

    /// Start driving charts this instance just adopted.
    async fn resume_charts(&self, _charts: &[ChartRef]) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Long-running side effect bound to one chart.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn owner(&self) -> &ChartRef;

    /// Forward an event from the chart into the activity.
    async fn send(&self, event: Value) -> Result<(), ActivityError>;

    /// Stream of events the activity produces for its owner.
    ///
    /// Called once per registration; the stream ends when the activity drops
    /// its sender.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value>;

    async fn stop(&self) -> Result<(), ActivityError>;
}
