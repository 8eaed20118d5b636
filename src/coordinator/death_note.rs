//! One-shot notification when an instance row flips to dying.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::InstanceBackend;
use crate::model::InstanceId;

/// Handle to a running death-note watch.
pub struct DeathNote {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeathNote {
    /// Stop polling. The callback will not run afterwards.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `false` once the watch fired or was cancelled.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Poll `instance_id`'s row every `interval` and call `on_death` once when
/// it is marked dying. Store errors are logged and the poll continues.
pub fn watch_death_note<B, F>(
    backend: B,
    instance_id: InstanceId,
    interval: Duration,
    on_death: F,
) -> DeathNote
where
    B: InstanceBackend + 'static,
    F: FnOnce() + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!(instance_id = %instance_id, "death note watch cancelled");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match backend.is_instance_dying(instance_id).await {
                Ok(true) => {
                    if cancelled.is_cancelled() {
                        return;
                    }
                    info!(instance_id = %instance_id, "instance marked dying");
                    on_death();
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(instance_id = %instance_id, error = %err, "death note poll failed");
                }
            }
        }
    });
    DeathNote { token, handle }
}
