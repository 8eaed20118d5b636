//! Stub runtime and activity shared by the unit tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::host::{Activity, ActivityError, ChartRuntime, DeliveryError};
use crate::model::ChartRef;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SentEvent {
    pub chart: ChartRef,
    pub event: Value,
    pub activity_id: Option<String>,
    pub correlation_id: String,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingRuntime {
    sent: Arc<Mutex<Vec<SentEvent>>>,
    resumed: Arc<Mutex<Vec<ChartRef>>>,
    failing: Arc<AtomicBool>,
    failing_resume: Arc<AtomicBool>,
}

impl RecordingRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_resume(&self, failing: bool) {
        self.failing_resume.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentEvent> {
        self.sent.lock().expect("sent poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent poisoned").len()
    }

    pub fn resumed(&self) -> Vec<ChartRef> {
        self.resumed.lock().expect("resumed poisoned").clone()
    }
}

#[async_trait]
impl ChartRuntime for RecordingRuntime {
    async fn send_event(
        &self,
        chart: &ChartRef,
        event: Value,
        activity_id: Option<&str>,
        correlation_id: &str,
    ) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                chart: chart.clone(),
                reason: "runtime switched to failing".to_string(),
            });
        }
        self.sent.lock().expect("sent poisoned").push(SentEvent {
            chart: chart.clone(),
            event,
            activity_id: activity_id.map(str::to_string),
            correlation_id: correlation_id.to_string(),
        });
        Ok(())
    }

    async fn resume_charts(&self, charts: &[ChartRef]) -> Result<(), DeliveryError> {
        if self.failing_resume.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                chart: charts[0].clone(),
                reason: "runtime switched to failing".to_string(),
            });
        }
        self.resumed
            .lock()
            .expect("resumed poisoned")
            .extend_from_slice(charts);
        Ok(())
    }
}

pub(crate) struct StubActivity {
    id: String,
    owner: ChartRef,
    sender: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    received: Mutex<Vec<Value>>,
    stops: AtomicUsize,
    fail_stop: bool,
}

impl StubActivity {
    pub fn new(owner: ChartRef, id: &str) -> Arc<Self> {
        Self::build(owner, id, false)
    }

    pub fn failing_stop(owner: ChartRef, id: &str) -> Arc<Self> {
        Self::build(owner, id, true)
    }

    fn build(owner: ChartRef, id: &str, fail_stop: bool) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: id.to_string(),
            owner,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            received: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            fail_stop,
        })
    }

    /// Produce an event for the owning chart.
    pub fn emit(&self, event: Value) {
        if let Some(sender) = self.sender.lock().expect("sender poisoned").as_ref() {
            let _ = sender.send(event);
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("received poisoned").clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Activity for StubActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &ChartRef {
        &self.owner
    }

    async fn send(&self, event: Value) -> Result<(), ActivityError> {
        self.received
            .lock()
            .expect("received poisoned")
            .push(event);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        match self.receiver.lock().expect("receiver poisoned").take() {
            Some(receiver) => receiver,
            None => mpsc::unbounded_channel().1,
        }
    }

    async fn stop(&self) -> Result<(), ActivityError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().expect("sender poisoned").take();
        if self.fail_stop {
            return Err(ActivityError::Failed("stop hook failed".to_string()));
        }
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub(crate) async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
