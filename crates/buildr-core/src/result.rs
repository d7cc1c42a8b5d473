//! Build result states and the per-job result cell.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Four-valued outcome reported for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum BuildResult {
    /// No terminal outcome yet.
    #[default]
    Pending,
    /// Every stage exited 0.
    Pass,
    /// A non-prepare script exited non-zero.
    Fail,
    /// Setup, environment, cancellation or unexpected fault.
    Error,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Pending => "Pending",
            BuildResult::Pass => "Pass",
            BuildResult::Fail => "Fail",
            BuildResult::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildResult::Pending)
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, write-once holder of a job's [`BuildResult`].
///
/// The job handler finalizes it; the remote progress relay reads it to tag
/// every outgoing message. Cloning shares the same cell.
#[derive(Debug, Clone, Default)]
pub struct ResultCell {
    inner: Arc<Mutex<BuildResult>>,
}

impl ResultCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value (`Pending` until finalized).
    pub fn get(&self) -> BuildResult {
        *self.lock()
    }

    /// Store the terminal result. Returns `false` and leaves the cell
    /// untouched if it was already finalized or `result` is `Pending`.
    pub fn finalize(&self, result: BuildResult) -> bool {
        if !result.is_terminal() {
            return false;
        }
        let mut current = self.lock();
        if current.is_terminal() {
            tracing::warn!(current = %*current, rejected = %result, "build result already finalized");
            return false;
        }
        *current = result;
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BuildResult> {
        // A poisoned cell still holds a valid enum value.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
