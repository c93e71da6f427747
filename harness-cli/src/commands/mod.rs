//! CLI command implementations.

pub mod cluster;
pub mod local;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use harness_core::runner::RunSummary;
use harness_core::HarnessConfig;
use tokio_util::sync::CancellationToken;

use crate::WorkloadArgs;

/// Load the config file if given, otherwise the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(HarnessConfig::default()),
    }
}

/// Apply workload flags on top of the file values.
pub fn apply_workload(config: &mut HarnessConfig, args: &WorkloadArgs) {
    let spec = &mut config.workload;
    if let Some(workers) = args.workers {
        spec.workers = workers;
    }
    if let Some(file_count) = args.file_count {
        spec.file_count = file_count;
    }
    if let Some(min_size) = args.min_size {
        spec.min_size = min_size;
    }
    if let Some(max_size) = args.max_size {
        spec.max_size = max_size;
    }
}

/// Exit status after a second interrupt (128 + SIGINT).
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// What a Ctrl-C does, by how many have arrived so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Abort setup and let cleanup run.
    Cancel,
    /// Give up on cleanup and exit.
    Exit,
}

/// First interrupt cancels, any later one exits.
pub fn interrupt_action(received: usize) -> InterruptAction {
    if received <= 1 {
        InterruptAction::Cancel
    } else {
        InterruptAction::Exit
    }
}

/// Token cancelled on the first Ctrl-C. A second Ctrl-C exits the process.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let mut received = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            received += 1;
            match interrupt_action(received) {
                InterruptAction::Cancel => {
                    tracing::warn!(
                        "interrupted, aborting setup and running cleanup (Ctrl-C again to exit)"
                    );
                    trigger.cancel();
                }
                InterruptAction::Exit => {
                    tracing::error!("interrupted again, exiting without finishing cleanup");
                    std::process::exit(INTERRUPT_EXIT_CODE);
                }
            }
        }
    });
    token
}

/// True when setup succeeded and no case failed.
pub fn run_passed(summary: &RunSummary) -> bool {
    if let Some(e) = &summary.setup_error {
        tracing::error!("run aborted during setup: {}", e);
        return false;
    }
    let (passed, total) = summary.counts();
    passed == total
}

/// Map a run summary to the process exit status.
pub fn exit_code(summary: &RunSummary) -> ExitCode {
    if run_passed(summary) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::suite::SuiteReport;
    use harness_core::HarnessError;

    #[test]
    fn workload_flags_override_file_values() {
        let mut config = HarnessConfig::default();
        let args = WorkloadArgs {
            workers: Some(8),
            max_size: Some(4096),
            ..WorkloadArgs::default()
        };
        apply_workload(&mut config, &args);
        assert_eq!(config.workload.workers, 8);
        assert_eq!(config.workload.file_count, 10);
        assert_eq!(config.workload.max_size, 4096);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
        assert!(load_config(None).is_ok());
    }

    #[test]
    fn setup_failure_fails_the_run() {
        let ok = RunSummary {
            setup_error: None,
            report: Some(SuiteReport { results: Vec::new() }),
        };
        assert!(run_passed(&ok));

        let aborted = RunSummary {
            setup_error: Some(HarnessError::InvalidConfig("x".into())),
            report: None,
        };
        assert!(!run_passed(&aborted));
    }

    #[test]
    fn second_interrupt_exits() {
        assert_eq!(interrupt_action(1), InterruptAction::Cancel);
        assert_eq!(interrupt_action(2), InterruptAction::Exit);
        assert_eq!(interrupt_action(3), InterruptAction::Exit);
    }
}
