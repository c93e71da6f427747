//! Mock channel for testing.
//!
//! Records every call and answers commands from a list of substring rules.
//! Commands that match no rule succeed with empty output.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CommandOutput, HostSpec, RemoteChannel, TransportError};

/// A call observed by [`MockChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    /// `exec(host, command)`.
    Exec {
        /// Host address.
        host: String,
        /// Command line.
        command: String,
    },
    /// `upload(host, local, remote)`.
    Upload {
        /// Host address.
        host: String,
        /// Local source path.
        local: PathBuf,
        /// Remote destination path.
        remote: String,
    },
    /// `download(host, remote, local)`.
    Download {
        /// Host address.
        host: String,
        /// Remote source path.
        remote: String,
        /// Local destination path.
        local: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    pattern: String,
    exit_code: i32,
    stdout: Vec<String>,
}

impl Rule {
    fn matches(&self, host: &str, command: &str) -> bool {
        self.host.as_deref().map_or(true, |h| h == host) && command.contains(&self.pattern)
    }
}

#[derive(Debug, Default)]
struct MockChannelInner {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
    failing_downloads: Vec<String>,
}

/// Scriptable [`RemoteChannel`] for tests.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    inner: Arc<Mutex<MockChannelInner>>,
}

impl MockChannel {
    /// Create a mock channel where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_rule(&self, rule: Rule) {
        let mut inner = self.inner.lock().unwrap();
        // Host-specific rules take precedence over global ones.
        if rule.host.is_some() {
            inner.rules.insert(0, rule);
        } else {
            inner.rules.push(rule);
        }
    }

    /// Fail every command containing `pattern` with `exit_code`.
    pub fn fail_on(&self, pattern: &str, exit_code: i32) {
        self.push_rule(Rule {
            host: None,
            pattern: pattern.to_string(),
            exit_code,
            stdout: Vec::new(),
        });
    }

    /// Fail commands containing `pattern` on one host only.
    pub fn fail_on_host(&self, host: &str, pattern: &str, exit_code: i32) {
        self.push_rule(Rule {
            host: Some(host.to_string()),
            pattern: pattern.to_string(),
            exit_code,
            stdout: Vec::new(),
        });
    }

    /// Answer commands containing `pattern` with the given stdout lines.
    pub fn respond(&self, pattern: &str, stdout: &[&str]) {
        self.push_rule(Rule {
            host: None,
            pattern: pattern.to_string(),
            exit_code: 0,
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Make every download from `host` fail.
    pub fn fail_downloads(&self, host: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failing_downloads.push(host.to_string());
    }

    /// All calls in the order they were made.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// `(host, command)` for every executed command containing `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Exec { host, command } if command.contains(pattern) => {
                    Some((host, command))
                }
                _ => None,
            })
            .collect()
    }

    /// Commands executed on one host, in order.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Exec { host: h, command } if h == host => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.commands_matching(pattern).len()
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn exec(&self, host: &HostSpec, command: &str) -> Result<CommandOutput, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RecordedCall::Exec {
            host: host.address.clone(),
            command: command.to_string(),
        });
        let output = inner
            .rules
            .iter()
            .find(|r| r.matches(&host.address, command))
            .map(|r| CommandOutput {
                exit_code: r.exit_code,
                stdout: r.stdout.clone(),
                stderr: if r.exit_code == 0 {
                    Vec::new()
                } else {
                    vec![format!("mock failure: {}", r.pattern)]
                },
            })
            .unwrap_or_default();
        Ok(output)
    }

    async fn upload(&self, host: &HostSpec, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.inner.lock().unwrap().calls.push(RecordedCall::Upload {
            host: host.address.clone(),
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        Ok(())
    }

    async fn download(&self, host: &HostSpec, remote: &str, local: &Path) -> Result<(), TransportError> {
        let fail = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(RecordedCall::Download {
                host: host.address.clone(),
                remote: remote.to_string(),
                local: local.to_path_buf(),
            });
            inner.failing_downloads.contains(&host.address)
        };
        if fail {
            return Err(TransportError::TransferFailed {
                host: host.address.clone(),
                detail: format!("mock download of {} refused", remote),
            });
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, format!("mock download of {}\n", remote)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Credentials;

    fn host(addr: &str) -> HostSpec {
        HostSpec::new(addr, "root", Credentials::Agent)
    }

    #[tokio::test]
    async fn unmatched_commands_succeed() {
        let channel = MockChannel::new();
        let out = channel.exec(&host("a"), "uname -a").await.unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn host_rule_overrides_global_rule() {
        let channel = MockChannel::new();
        channel.respond("nproc", &["8"]);
        channel.fail_on_host("b", "nproc", 127);

        let a = channel.exec(&host("a"), "nproc").await.unwrap();
        let b = channel.exec(&host("b"), "nproc").await.unwrap();
        assert_eq!(a.first_line(), Some("8"));
        assert_eq!(b.exit_code, 127);
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let channel = MockChannel::new();
        channel.exec(&host("a"), "one").await.unwrap();
        channel
            .upload(&host("a"), Path::new("/tmp/x"), "/root/x")
            .await
            .unwrap();
        channel.exec(&host("b"), "two").await.unwrap();

        assert_eq!(channel.calls().len(), 3);
        assert_eq!(channel.commands_on("a"), vec!["one"]);
        assert_eq!(channel.count("two"), 1);
    }

    #[tokio::test]
    async fn download_writes_placeholder_or_fails() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MockChannel::new();
        channel.fail_downloads("bad");

        let ok = dir.path().join("node_a/nkfs.log");
        channel.download(&host("a"), "/root/sshexec/nkfs.log", &ok).await.unwrap();
        assert!(ok.exists());

        let err = channel
            .download(&host("bad"), "/root/sshexec/nkfs.log", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TransferFailed { .. }));
    }
}
