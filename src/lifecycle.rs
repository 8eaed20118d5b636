//! Process-wide "dying" flag.
//!
//! Starts `false`, flips to `true` at most once and never resets. Every
//! background loop (scheduler poll, adoption retry, death-note watch) reads
//! it at the top of its own tick instead of being told to stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Clone, Debug, Default)]
pub struct DyingFlag {
    raised: Arc<AtomicBool>,
    token: CancellationToken,
}

impl DyingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dying(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Raise the flag. Returns `true` for the call that actually flipped it.
    pub fn set(&self) -> bool {
        if self.raised.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Resolves once the flag is raised.
    pub fn wait(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}
