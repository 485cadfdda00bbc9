//! Last-in-first-out registry of undo actions.
//!
//! Every component that creates on-disk or registered state pushes a
//! [`CleanupAction`] the moment the forward effect has succeeded. When a run
//! fails, [`CleanupStack::unwind`] reverses everything in strict reverse
//! order; when it succeeds, [`CleanupStack::commit`] forgets the actions.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A recorded way to reverse an effect that has already been applied.
pub struct CleanupAction {
    name: String,
    target: String,
    undo: UndoFn,
}

impl CleanupAction {
    /// Create an action from an async reversal function.
    pub fn new<F, Fut>(name: impl Into<String>, target: impl Into<String>, undo: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            target: target.into(),
            undo: Box::new(move || undo().boxed()),
        }
    }

    /// Remove a directory tree. A directory that is already gone counts as
    /// removed.
    pub fn remove_dir(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let target = path.display().to_string();
        Self::new("rmdir", target, move || async move {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupAction")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish()
    }
}

/// A reversal that did not succeed during unwind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub action: String,
    pub target: String,
    pub reason: String,
}

/// A reversal that ran during unwind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRecord {
    pub action: String,
    pub target: String,
    pub success: bool,
}

/// What happened during one unwind.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Every invoked action, in invocation order.
    pub invoked: Vec<CleanupRecord>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Shared handle to the cleanup registry of a provisioning run.
///
/// Clones share the same stack, so parallel steps may register actions
/// concurrently. Registration order is the order in which `register`
/// calls complete.
#[derive(Clone, Default)]
pub struct CleanupStack {
    entries: Arc<Mutex<Vec<CleanupAction>>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an action for an effect that has just been applied.
    pub fn register(&self, action: CleanupAction) {
        debug!(action = %action.name, target = %action.target, "Cleanup action registered");
        self.lock().push(action);
    }

    /// Forget every registered action without running it.
    ///
    /// Returns the number of discarded actions.
    pub fn commit(&self) -> usize {
        let discarded = std::mem::take(&mut *self.lock()).len();
        debug!(discarded, "Cleanup stack committed");
        discarded
    }

    /// Run every registered action, most recent first.
    ///
    /// A failing action is recorded and the unwind continues with the next
    /// one. Actions are taken off the stack one at a time, so if the unwind
    /// itself is dropped midway the actions it has not reached stay
    /// registered. The stack is empty afterwards and a second call does
    /// nothing.
    pub async fn unwind(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let pending = self.len();
        if pending == 0 {
            return report;
        }

        info!(actions = pending, "Unwinding cleanup stack");

        loop {
            let Some(action) = self.lock().pop() else {
                break;
            };
            let CleanupAction { name, target, undo } = action;
            debug!(action = %name, target = %target, "Running cleanup action");

            let outcome = std::panic::AssertUnwindSafe(undo())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(OrchestratorError::Panicked(format!("cleanup '{}'", name)))
                });

            match outcome {
                Ok(()) => {
                    report.invoked.push(CleanupRecord {
                        action: name,
                        target,
                        success: true,
                    });
                }
                Err(e) => {
                    warn!(action = %name, target = %target, error = %e, "Cleanup action failed");
                    report.invoked.push(CleanupRecord {
                        action: name.clone(),
                        target: target.clone(),
                        success: false,
                    });
                    report.failures.push(CleanupFailure {
                        action: name,
                        target,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names of the registered actions, oldest first.
    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|a| a.name.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CleanupAction>> {
        // A panic elsewhere must not prevent rollback.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field("entries", &self.len())
            .finish()
    }
}
