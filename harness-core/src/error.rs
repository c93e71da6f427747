//! Error types for the harness.
//!
//! Setup-phase variants (`Provision`, `Start`, `Registration`) abort a run.
//! Teardown-phase variants (`Stop`, `LogCollection`, device removal) are only ever
//! logged and suppressed by the best-effort wrappers in [`crate::executor`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::remote::TransportError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Errors from harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Fetching or building the service on a node failed.
    #[error("provision failed on {node}: {source}")]
    Provision {
        /// Node address.
        node: String,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// Loading modules, attaching devices or starting the server failed.
    #[error("service start failed on {node}: {source}")]
    Start {
        /// Node address.
        node: String,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// Stopping the server or unloading modules failed.
    #[error("service stop failed on {node}: {source}")]
    Stop {
        /// Node address.
        node: String,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// Registering a neighbor with a node failed.
    #[error("neighbor registration {node} -> {peer} failed: {source}")]
    Registration {
        /// Node the registration was issued on.
        node: String,
        /// Peer being registered.
        peer: String,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// Collecting diagnostics from a node failed.
    #[error("log collection failed on {node}: {source}")]
    LogCollection {
        /// Node address.
        node: String,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// Content did not survive a round trip through the store.
    #[error("{} broken file(s): {}", .broken.len(), .broken.join(", "))]
    Verification {
        /// Names of files whose output was missing or differed from the input.
        broken: Vec<String>,
    },

    /// Remote execution or file transfer failed outside a named phase.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// One or more units of a parallel batch failed.
    #[error("{phase}: {failed} of {total} operations failed ({})", .labels.join(", "))]
    Aggregate {
        /// Batch phase name.
        phase: String,
        /// Number of failed units.
        failed: usize,
        /// Number of units in the batch.
        total: usize,
        /// Labels of the failed units.
        labels: Vec<String>,
    },

    /// A batch was cancelled before all units completed.
    #[error("{phase}: cancelled")]
    Cancelled {
        /// Batch phase name.
        phase: String,
    },

    /// A unit of work panicked.
    #[error("{label} panicked: {message}")]
    Panicked {
        /// Unit label.
        label: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Configuration file could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Returns true for errors raised while bringing the cluster up.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::Provision { .. }
                | HarnessError::Start { .. }
                | HarnessError::Registration { .. }
                | HarnessError::Aggregate { .. }
        )
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_names_failed_count() {
        let err = HarnessError::Aggregate {
            phase: "start".into(),
            failed: 2,
            total: 5,
            labels: vec!["10.0.0.1".into(), "10.0.0.3".into()],
        };
        assert_eq!(
            err.to_string(),
            "start: 2 of 5 operations failed (10.0.0.1, 10.0.0.3)"
        );
    }

    #[test]
    fn verification_lists_broken_files() {
        let err = HarnessError::Verification {
            broken: vec!["worker-0/a".into(), "worker-1/b".into()],
        };
        assert_eq!(err.to_string(), "2 broken file(s): worker-0/a, worker-1/b");
    }

    #[test]
    fn start_failure_is_setup_failure() {
        let err = HarnessError::Start {
            node: "10.0.0.1".into(),
            source: TransportError::CommandFailed {
                host: "10.0.0.1".into(),
                command: "insmod".into(),
                exit_code: 1,
                stderr: String::new(),
            },
        };
        assert!(err.is_setup_failure());
        assert!(!HarnessError::Cancelled { phase: "x".into() }.is_setup_failure());
    }

    #[test]
    fn panic_message_from_str_and_string() {
        let a: Box<dyn std::any::Any + Send> = Box::new("boom");
        let b: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        let c: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(a.as_ref()), "boom");
        assert_eq!(panic_message(b.as_ref()), "bang");
        assert_eq!(panic_message(c.as_ref()), "non-string panic payload");
    }
}
