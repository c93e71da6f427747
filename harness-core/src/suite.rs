//! Test cases and suites.
//!
//! A case moves through `Created -> Preparing -> Running -> Passed | Failed ->
//! Cleaned`. It passes only if its `test` calls [`Verdict::mark_passed`] and
//! returns `Ok`; finishing without the mark is a failure. `cleanup` runs exactly
//! once per `run`, whatever happened before it, and its errors and panics are
//! logged and dropped.
//!
//! A suite runs its cases in order. An error escaping one case is logged and the
//! next case still runs.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use uuid::Uuid;

use crate::env::Environment;
use crate::error::{panic_message, HarnessError, Result};

/// Lifecycle state of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    /// Constructed, not yet run.
    Created,
    /// `prepare` in progress.
    Preparing,
    /// `test` in progress.
    Running,
    /// Finished with the pass mark set.
    Passed,
    /// Finished without the pass mark, or with an error.
    Failed,
    /// `cleanup` has been attempted.
    Cleaned,
}

/// Pass mark handed to [`TestCase::test`]. Starts unset.
#[derive(Debug, Default)]
pub struct Verdict {
    passed: bool,
}

impl Verdict {
    /// Record that the test passed.
    pub fn mark_passed(&mut self) {
        self.passed = true;
    }

    /// Whether the pass mark was set.
    pub fn is_passed(&self) -> bool {
        self.passed
    }
}

/// Identity and outcome of one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    /// Case name.
    pub name: String,
    /// Unique id of this run of the case.
    pub uid: Uuid,
    /// False until the case passes.
    pub passed: bool,
}

impl TestResult {
    /// `"<name> : <uid>"`, the form used in logs and reports.
    pub fn uid_name(&self) -> String {
        format!("{} : {}", self.name, self.uid)
    }
}

/// One test against a prepared environment.
#[async_trait]
pub trait TestCase: Send {
    /// Case name used in reports.
    fn name(&self) -> &str;

    /// Allocate case-private resources.
    async fn prepare(&mut self, _env: &dyn Environment) -> Result<()> {
        Ok(())
    }

    /// Run the test; call `verdict.mark_passed()` on success.
    async fn test(&mut self, env: &dyn Environment, verdict: &mut Verdict) -> Result<()>;

    /// Release case-private resources. Called once per run, after any outcome.
    async fn cleanup(&mut self, _env: &dyn Environment) -> Result<()> {
        Ok(())
    }
}

async fn guarded<F>(label: &str, future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HarnessError::Panicked {
            label: label.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Drives one [`TestCase`] through its lifecycle.
pub struct CaseRunner {
    case: Box<dyn TestCase>,
    result: TestResult,
    state: CaseState,
}

impl std::fmt::Debug for CaseRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseRunner")
            .field("result", &self.result)
            .field("state", &self.state)
            .finish()
    }
}

impl CaseRunner {
    /// Wrap a case, assigning it a fresh unique id.
    pub fn new(case: Box<dyn TestCase>) -> Self {
        let result = TestResult {
            name: case.name().to_string(),
            uid: Uuid::new_v4(),
            passed: false,
        };
        Self {
            case,
            result,
            state: CaseState::Created,
        }
    }

    /// Current state.
    pub fn state(&self) -> CaseState {
        self.state
    }

    /// Identity and outcome.
    pub fn result(&self) -> &TestResult {
        &self.result
    }

    /// Prepare, test and clean up. Errors from `prepare` or `test` (including
    /// panics) are returned after cleanup has been attempted.
    pub async fn run(&mut self, env: &dyn Environment) -> Result<()> {
        let uid_name = self.result.uid_name();
        let mut verdict = Verdict::default();

        tracing::info!("PREPARING {}", uid_name);
        self.state = CaseState::Preparing;
        let mut outcome = guarded(&uid_name, self.case.prepare(env)).await;

        if outcome.is_ok() {
            tracing::info!("STARTING {}", uid_name);
            self.state = CaseState::Running;
            outcome = guarded(&uid_name, self.case.test(env, &mut verdict)).await;
        }

        self.result.passed = outcome.is_ok() && verdict.is_passed();
        if self.result.passed {
            self.state = CaseState::Passed;
            tracing::info!("PASSED {}", uid_name);
        } else {
            self.state = CaseState::Failed;
            match &outcome {
                Err(e) => tracing::error!("FAILED {}: {}", uid_name, e),
                Ok(()) => tracing::error!("FAILED {}", uid_name),
            }
        }

        if let Err(e) = guarded(&uid_name, self.case.cleanup(env)).await {
            tracing::error!("cleanup of {} failed: {}", uid_name, e);
        }
        self.state = CaseState::Cleaned;
        outcome
    }
}

/// Ordered list of cases run against one environment.
#[derive(Debug, Default)]
pub struct TestSuite {
    cases: Vec<CaseRunner>,
}

impl TestSuite {
    /// Empty suite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a case.
    pub fn add(&mut self, case: impl TestCase + 'static) {
        self.cases.push(CaseRunner::new(Box::new(case)));
    }

    /// Append several boxed cases.
    pub fn extend(&mut self, cases: impl IntoIterator<Item = Box<dyn TestCase>>) {
        self.cases.extend(cases.into_iter().map(CaseRunner::new));
    }

    /// Number of cases.
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// True if the suite has no cases.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Case runners in order.
    pub fn cases(&self) -> &[CaseRunner] {
        &self.cases
    }

    /// Run every case in order and report.
    pub async fn run(&mut self, env: &dyn Environment) -> SuiteReport {
        for case in &mut self.cases {
            if let Err(e) = case.run(env).await {
                tracing::error!("{} raised: {}", case.result().uid_name(), e);
            }
        }
        let report = SuiteReport {
            results: self.cases.iter().map(|c| c.result().clone()).collect(),
        };
        report.log();
        report
    }
}

/// Pass/fail per case plus the aggregate count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteReport {
    /// Results in run order.
    pub results: Vec<TestResult>,
}

impl SuiteReport {
    /// Number of passed cases.
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Number of cases.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// True if every case passed (an empty suite passes).
    pub fn all_passed(&self) -> bool {
        self.passed_count() == self.total()
    }

    /// Report lines: the summary, then one line per case.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "TESTS PASSED {} among {}",
            self.passed_count(),
            self.total()
        )];
        for r in &self.results {
            let tag = if r.passed { "PASSED" } else { "FAILED" };
            lines.push(format!("{} {}", tag, r.uid_name()));
        }
        lines
    }

    fn log(&self) {
        for (i, line) in self.lines().iter().enumerate() {
            if i > 0 && line.starts_with("FAILED") {
                tracing::error!("{}", line);
            } else {
                tracing::info!("{}", line);
            }
        }
    }
}
