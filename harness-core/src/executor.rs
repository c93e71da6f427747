//! Parallel execution with aggregated failure reporting.
//!
//! [`ParallelExecutor`] runs a batch of independent operations, one spawned task per
//! operation, waits for every one of them and reports a single outcome for the batch.
//! A failing or panicking operation never cancels its siblings: later operations may
//! be doing cleanup-class work (log collection, shutdown) that must still happen on
//! every node.
//!
//! Teardown call sites use [`best_effort`] (parallel) or [`attempt`] (one sequential
//! step). Both log failures and swallow them so the next teardown phase always runs.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{panic_message, HarnessError, Result};

/// Boxed future produced by a [`Task`].
pub type TaskFuture<T> = BoxFuture<'static, Result<T>>;

/// One labelled, zero-argument operation.
pub struct Task<T> {
    label: String,
    future: TaskFuture<T>,
}

impl<T> Task<T> {
    /// Wrap a future as a task. The label identifies it in outcomes and logs.
    pub fn new<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            label: label.into(),
            future: future.boxed(),
        }
    }

    /// Task label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish()
    }
}

/// How a single task ended.
#[derive(Debug)]
pub enum Status<T> {
    /// Completed with a value.
    Succeeded(T),
    /// Returned an error.
    Failed(HarnessError),
    /// Panicked; the payload message is kept.
    Panicked(String),
    /// Aborted by cancellation before completing.
    Cancelled,
}

/// Result of one task in a batch.
#[derive(Debug)]
pub struct ExecutionOutcome<T> {
    /// Task label.
    pub label: String,
    /// How the task ended.
    pub status: Status<T>,
}

impl<T> ExecutionOutcome<T> {
    /// Returns true if the task completed successfully.
    pub fn succeeded(&self) -> bool {
        matches!(self.status, Status::Succeeded(_))
    }

    /// Failure description, if the task did not succeed.
    pub fn failure(&self) -> Option<String> {
        match &self.status {
            Status::Succeeded(_) => None,
            Status::Failed(e) => Some(e.to_string()),
            Status::Panicked(msg) => Some(format!("panicked: {}", msg)),
            Status::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// Outcomes of a batch, in submission order.
#[derive(Debug)]
pub struct BatchReport<T> {
    phase: String,
    outcomes: Vec<ExecutionOutcome<T>>,
}

impl<T> BatchReport<T> {
    /// Batch phase name.
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// All outcomes, in submission order.
    pub fn outcomes(&self) -> &[ExecutionOutcome<T>] {
        &self.outcomes
    }

    /// Number of tasks in the batch.
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Number of tasks that did not succeed.
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded()).count()
    }

    /// True iff every task succeeded (an empty batch succeeds).
    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Labels of tasks that did not succeed.
    pub fn failed_labels(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.label.clone())
            .collect()
    }

    /// Labels of tasks that succeeded.
    pub fn succeeded_labels(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| o.label.clone())
            .collect()
    }

    /// Values of the successful tasks, in submission order.
    pub fn into_values(self) -> Vec<T> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o.status {
                Status::Succeeded(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// The aggregate error for this batch, if any task did not succeed.
    pub fn failure(&self) -> Option<HarnessError> {
        if self
            .outcomes
            .iter()
            .any(|o| matches!(o.status, Status::Cancelled))
        {
            return Some(HarnessError::Cancelled {
                phase: self.phase.clone(),
            });
        }
        let failed = self.failed_count();
        (failed > 0).then(|| HarnessError::Aggregate {
            phase: self.phase.clone(),
            failed,
            total: self.total(),
            labels: self.failed_labels(),
        })
    }

    /// `Ok(self)` if every task succeeded, otherwise the aggregate error.
    pub fn into_result(self) -> Result<Self> {
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Runs batches of independent tasks concurrently.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    phase: String,
    cancel: Option<CancellationToken>,
}

impl ParallelExecutor {
    /// Create an executor for a named phase.
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            cancel: None,
        }
    }

    /// Make the join abortable. Tasks still running when the token fires are
    /// aborted and reported as [`Status::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run every task to completion and collect the outcomes. Never fails.
    pub async fn join<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> BatchReport<T> {
        let total = tasks.len();
        tracing::info!(phase = %self.phase, "starting {} operation(s)", total);

        let mut labels = Vec::with_capacity(total);
        let mut set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let span = tracing::info_span!("task", phase = %self.phase, label = %task.label);
            labels.push(task.label);
            let future = AssertUnwindSafe(task.future).catch_unwind();
            set.spawn(async move { (index, future.await) }.instrument(span));
        }

        let mut slots: Vec<Option<Status<T>>> = (0..total).map(|_| None).collect();
        let mut cancelled = false;
        loop {
            let joined = match (&self.cancel, cancelled) {
                (Some(token), false) => tokio::select! {
                    _ = token.cancelled() => {
                        tracing::warn!(phase = %self.phase, "cancelled, aborting remaining operations");
                        cancelled = true;
                        set.abort_all();
                        continue;
                    }
                    joined = set.join_next() => joined,
                },
                _ => set.join_next().await,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((index, Ok(result))) => {
                    let status = match result {
                        Ok(value) => {
                            tracing::info!(phase = %self.phase, "{}: ok", labels[index]);
                            Status::Succeeded(value)
                        }
                        Err(e) => {
                            tracing::error!(phase = %self.phase, "{}: failed: {}", labels[index], e);
                            Status::Failed(e)
                        }
                    };
                    slots[index] = Some(status);
                }
                Ok((index, Err(payload))) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(phase = %self.phase, "{}: panicked: {}", labels[index], message);
                    slots[index] = Some(Status::Panicked(message));
                }
                // Aborted tasks keep an empty slot and are reported as cancelled.
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(phase = %self.phase, "join error: {}", e),
            }
        }

        let outcomes = labels
            .into_iter()
            .zip(slots)
            .map(|(label, slot)| ExecutionOutcome {
                label,
                status: slot.unwrap_or(Status::Cancelled),
            })
            .collect();
        let report = BatchReport {
            phase: self.phase.clone(),
            outcomes,
        };
        tracing::info!(
            phase = %self.phase,
            "finished: {} of {} succeeded",
            report.total() - report.failed_count(),
            report.total()
        );
        report
    }

    /// Run every task to completion; fail with an aggregate error if any did not succeed.
    pub async fn run<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> Result<BatchReport<T>> {
        self.join(tasks).await.into_result()
    }
}

/// Run a teardown or diagnostics batch, logging and suppressing any failure.
///
/// Best-effort batches are never cancellable.
pub async fn best_effort<T: Send + 'static>(phase: &str, tasks: Vec<Task<T>>) -> BatchReport<T> {
    let report = ParallelExecutor::new(phase).join(tasks).await;
    if let Some(err) = report.failure() {
        tracing::warn!("best-effort {}: {} (continuing)", phase, err);
    }
    report
}

/// Run one sequential teardown step, logging and suppressing errors and panics.
pub async fn attempt<T, F>(step: &str, future: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!("{} failed (continuing): {}", step, e);
            None
        }
        Err(payload) => {
            tracing::error!(
                "{} panicked (continuing): {}",
                step,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}
