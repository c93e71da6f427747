//! Top-level run: prepare the environment, run the suite, always clean up.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::env::Environment;
use crate::error::{panic_message, HarnessError};
use crate::executor::attempt;
use crate::suite::{SuiteReport, TestSuite};

/// Outcome of one harness run.
#[derive(Debug)]
pub struct RunSummary {
    /// Error that aborted environment setup, if any.
    pub setup_error: Option<HarnessError>,
    /// Suite report; `None` when setup failed and no case ran.
    pub report: Option<SuiteReport>,
}

impl RunSummary {
    /// True if setup succeeded and every case passed.
    pub fn success(&self) -> bool {
        self.setup_error.is_none() && self.report.as_ref().is_some_and(SuiteReport::all_passed)
    }

    /// `(passed, total)` case counts; `(0, 0)` when no case ran.
    pub fn counts(&self) -> (usize, usize) {
        self.report
            .as_ref()
            .map_or((0, 0), |r| (r.passed_count(), r.total()))
    }
}

/// Prepare `env`, run `suite` against it, then clean up.
///
/// Cleanup runs whether or not setup succeeded, and its failures never replace
/// a setup error.
pub async fn run(env: &mut dyn Environment, suite: &mut TestSuite) -> RunSummary {
    tracing::info!("preparing {} environment", env.name());
    let prepared = AssertUnwindSafe(env.prepare()).catch_unwind().await;
    let prepared = match prepared {
        Ok(result) => result,
        Err(payload) => Err(HarnessError::Panicked {
            label: format!("{} prepare", env.name()),
            message: panic_message(payload.as_ref()),
        }),
    };

    let summary = match prepared {
        Ok(()) => {
            tracing::info!("running {} case(s)", suite.len());
            RunSummary {
                setup_error: None,
                report: Some(suite.run(&*env).await),
            }
        }
        Err(e) => {
            tracing::error!("setup failed: {}", e);
            RunSummary {
                setup_error: Some(e),
                report: None,
            }
        }
    };

    tracing::info!("cleaning up {} environment", env.name());
    attempt("cleanup", async {
        env.cleanup().await;
        Ok::<_, HarnessError>(())
    })
    .await;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryObjectStore, ObjectStore};
    use crate::error::Result;
    use crate::suite::{TestCase, Verdict};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEnv {
        fail_prepare: bool,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Environment for CountingEnv {
        fn name(&self) -> &str {
            "counting"
        }
        async fn prepare(&mut self) -> Result<()> {
            if self.fail_prepare {
                return Err(HarnessError::InvalidConfig("no devices".into()));
            }
            Ok(())
        }
        async fn cleanup(&mut self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
        fn store(&self, _worker: usize) -> Arc<dyn ObjectStore> {
            Arc::new(MemoryObjectStore::new())
        }
        async fn query_status(&self) {}
    }

    struct AlwaysPass;

    #[async_trait]
    impl TestCase for AlwaysPass {
        fn name(&self) -> &str {
            "AlwaysPass"
        }
        async fn test(&mut self, _env: &dyn Environment, verdict: &mut Verdict) -> Result<()> {
            verdict.mark_passed();
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_run() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut env = CountingEnv {
            fail_prepare: false,
            cleanups: cleanups.clone(),
        };
        let mut suite = TestSuite::new();
        suite.add(AlwaysPass);

        let summary = run(&mut env, &mut suite).await;
        assert!(summary.success());
        assert_eq!(summary.counts(), (1, 1));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn setup_failure_still_cleans_up() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut env = CountingEnv {
            fail_prepare: true,
            cleanups: cleanups.clone(),
        };
        let mut suite = TestSuite::new();
        suite.add(AlwaysPass);

        let summary = run(&mut env, &mut suite).await;
        assert!(!summary.success());
        assert!(summary.report.is_none());
        assert_eq!(summary.counts(), (0, 0));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_suite_succeeds_when_setup_does() {
        let mut env = CountingEnv {
            fail_prepare: false,
            cleanups: Arc::new(AtomicUsize::new(0)),
        };
        let summary = run(&mut env, &mut TestSuite::new()).await;
        assert!(summary.success());
    }
}
