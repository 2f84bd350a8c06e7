//! Deadline-guarded calls.
//!
//! A probe may block forever inside the database client. The guard runs the
//! probe as a detached task, waits on a single-slot result channel, and
//! gives up after the deadline. The detached task is never cancelled: if it
//! finishes late its send fails because the receiver is gone, and the
//! result is dropped.
//!
//! Abandoned tasks are bounded: each [`ProbeCategory`] has one slot, and
//! every feature rule has a slot of its own. While an abandoned probe of a
//! category is still running, a new call of that category reports
//! [`CallOutcome::Hanging`] immediately instead of piling another stuck task
//! on top of it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbkeeper::gateway::{GatewayError, ProcessLauncher, QueryExecutor, Row};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

/// What became of a guarded call.
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// Finished within the deadline.
    Completed(T),
    /// Did not finish within the deadline (or an earlier call of the same
    /// category is still stuck).
    Hanging,
    /// Finished within the deadline with an error.
    Failed(GatewayError),
}

impl<T> CallOutcome<T> {
    /// Whether the call hung.
    pub fn is_hanging(&self) -> bool {
        matches!(self, Self::Hanging)
    }
}

/// Families of probes that share one in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeCategory {
    /// OS commands: process list, replication state, CPU sampling.
    Os,
    /// `select * from dummy`.
    Ping,
    /// Validation and sampling of the feature rule with this 1-based id.
    Feature(usize),
    /// Session kill actions.
    Session,
    /// Plan cache analysis.
    PlanCache,
}

/// Runs probes under a deadline with one in-flight slot per category.
#[derive(Debug)]
pub struct DeadlineGuard {
    slots: Mutex<HashMap<ProbeCategory, Arc<Semaphore>>>,
}

impl Default for DeadlineGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlineGuard {
    /// Create a guard with every slot free.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The slot of `category`, created free on first use.
    fn slot(&self, category: ProbeCategory) -> Option<Arc<Semaphore>> {
        let mut slots = self.slots.lock().ok()?;
        let slot = slots
            .entry(category)
            .or_insert_with(|| Arc::new(Semaphore::new(1)));
        Some(Arc::clone(slot))
    }

    /// Run `op` with a deadline.
    ///
    /// The future is spawned; its result is returned if it arrives before
    /// `timeout`. A zero timeout still lets an already-ready future win the
    /// race against the timer.
    pub async fn call<T, F>(
        &self,
        category: ProbeCategory,
        timeout: Duration,
        op: F,
    ) -> CallOutcome<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let Some(slot) = self.slot(category) else {
            return CallOutcome::Failed(GatewayError::Lost);
        };
        let Ok(permit) = slot.try_acquire_owned() else {
            warn!(?category, "previous probe still running, treating as hanging");
            return CallOutcome::Hanging;
        };

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = op.await;
            // Free the slot before publishing so the caller can issue the
            // next call as soon as it sees this result.
            drop(permit);
            if tx.send(result).is_err() {
                debug!(?category, "late probe result discarded");
            }
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => CallOutcome::Completed(value),
            Ok(Ok(Err(e))) => CallOutcome::Failed(e),
            Ok(Err(_)) => CallOutcome::Failed(GatewayError::Lost),
            Err(_) => {
                debug!(?category, timeout_ms = timeout.as_millis(), "probe exceeded deadline");
                CallOutcome::Hanging
            }
        }
    }

    /// Guarded [`QueryExecutor::query`].
    pub async fn query(
        &self,
        category: ProbeCategory,
        timeout: Duration,
        executor: &Arc<dyn QueryExecutor>,
        sql: impl Into<String>,
    ) -> CallOutcome<Vec<Row>> {
        let executor = Arc::clone(executor);
        let sql = sql.into();
        self.call(category, timeout, async move { executor.query(&sql).await })
            .await
    }

    /// Guarded [`ProcessLauncher::run`].
    pub async fn run(
        &self,
        category: ProbeCategory,
        timeout: Duration,
        launcher: &Arc<dyn ProcessLauncher>,
        command_line: impl Into<String>,
    ) -> CallOutcome<String> {
        let launcher = Arc::clone(launcher);
        let command_line = command_line.into();
        self.call(category, timeout, async move {
            launcher.run(&command_line).await
        })
        .await
    }
}
