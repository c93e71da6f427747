//! Remote command execution and file transfer.
//!
//! The harness needs exactly three things from a host: run a command and get back
//! `(exit code, stdout lines, stderr lines)`, upload a file, download a file.
//! [`RemoteChannel`] captures that; implementations are:
//!
//! - [`SshChannel`]: shells out to `ssh`/`scp` (real clusters)
//! - [`LocalChannel`]: `sh -c` on the harness host (loopback runs)
//! - [`MockChannel`]: scripted responses and recorded calls (tests)
//!
//! Channels are shared across concurrent workers behind an `Arc`, so every
//! implementation must be safe to call from many tasks against different hosts.

mod local;
mod mock;
mod ssh;

pub use local::LocalChannel;
pub use mock::{MockChannel, RecordedCall};
pub use ssh::{SshChannel, DEFAULT_CONNECT_TIMEOUT_SECS};

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from remote execution and file transfer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The local helper process (ssh, scp, sh) could not be spawned.
    #[error("spawn error: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command ran and returned a non-zero exit code.
    #[error("command failed on {host}: `{command}` exit={exit_code}, stderr={stderr}")]
    CommandFailed {
        /// Target host.
        host: String,
        /// Command line that was executed.
        command: String,
        /// Exit code (-1 when killed by a signal).
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// Uploading or downloading a file failed.
    #[error("transfer failed on {host}: {detail}")]
    TransferFailed {
        /// Target host.
        host: String,
        /// Failure detail.
        detail: String,
    },

    /// The command succeeded but did not print the expected output.
    #[error("no output from `{command}` on {host}")]
    MissingOutput {
        /// Target host.
        host: String,
        /// Command line that was executed.
        command: String,
    },
}

impl TransportError {
    /// Exit code of a failed command, if the failure was a non-zero exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TransportError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// How to authenticate against a host.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Use the running ssh-agent or default identity files.
    Agent,
    /// Password authentication (passed to `sshpass` via the environment).
    Password(String),
    /// Private key file.
    KeyFile(PathBuf),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Agent => write!(f, "Agent"),
            Credentials::Password(_) => write!(f, "Password(<redacted>)"),
            Credentials::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
        }
    }
}

/// A host plus the identity used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Host name or IP address.
    pub address: String,
    /// Login user.
    pub user: String,
    /// Authentication method.
    pub credentials: Credentials,
}

impl HostSpec {
    /// Create a host spec.
    pub fn new(address: impl Into<String>, user: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            credentials,
        }
    }

    /// `user@address`, as used by ssh and scp.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,
    /// Standard output, split into lines.
    pub stdout: Vec<String>,
    /// Standard error, split into lines.
    pub stderr: Vec<String>,
}

impl CommandOutput {
    /// Build an output from raw process bytes.
    pub fn from_raw(exit_code: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_code,
            stdout: split_lines(stdout),
            stderr: split_lines(stderr),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty stdout line, trimmed.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Command execution and file transfer against a host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Execute a command on the host.
    ///
    /// Returns the raw result including the exit code; does NOT fail on non-zero exit.
    /// Use [`RemoteChannelExt::exec_ok`] for that.
    async fn exec(&self, host: &HostSpec, command: &str) -> Result<CommandOutput, TransportError>;

    /// Copy a local file to the host.
    async fn upload(&self, host: &HostSpec, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Copy a file from the host to a local path.
    async fn download(&self, host: &HostSpec, remote: &str, local: &Path) -> Result<(), TransportError>;
}

/// Logging and exit-code helpers shared by every channel.
#[async_trait]
pub trait RemoteChannelExt: RemoteChannel {
    /// Execute a command, logging it and failing on non-zero exit.
    async fn exec_ok(&self, host: &HostSpec, command: &str) -> Result<CommandOutput, TransportError> {
        let output = self.exec_logged(host, command).await?;
        if !output.success() {
            return Err(TransportError::CommandFailed {
                host: host.address.clone(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.join("\n"),
            });
        }
        Ok(output)
    }

    /// Execute a command, logging the command line and its exit code.
    async fn exec_logged(&self, host: &HostSpec, command: &str) -> Result<CommandOutput, TransportError> {
        tracing::info!(host = %host.address, "exec: {}", command);
        let output = self.exec(host, command).await?;
        for line in &output.stdout {
            tracing::debug!(host = %host.address, "stdout: {}", line);
        }
        for line in &output.stderr {
            tracing::debug!(host = %host.address, "stderr: {}", line);
        }
        if output.success() {
            tracing::info!(host = %host.address, "exec: {} rc=0", command);
        } else {
            tracing::error!(host = %host.address, "exec: {} rc={}", command, output.exit_code);
        }
        Ok(output)
    }
}

impl<T: RemoteChannel + ?Sized> RemoteChannelExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_splits_lines() {
        let out = CommandOutput::from_raw(0, b"a1b2\nsecond\n", b"warn\n");
        assert_eq!(out.stdout, vec!["a1b2", "second"]);
        assert_eq!(out.stderr, vec!["warn"]);
        assert!(out.success());
        assert_eq!(out.first_line(), Some("a1b2"));
    }

    #[test]
    fn first_line_skips_blank_lines() {
        let out = CommandOutput::from_raw(0, b"\n   \n  id-42  \n", b"");
        assert_eq!(out.first_line(), Some("id-42"));
        assert_eq!(CommandOutput::default().first_line(), None);
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let creds = Credentials::Password("hunter2".into());
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn host_login() {
        let host = HostSpec::new("10.0.0.7", "root", Credentials::Agent);
        assert_eq!(host.login(), "root@10.0.0.7");
    }

    #[test]
    fn exit_code_of_command_failure() {
        let err = TransportError::CommandFailed {
            host: "h".into(),
            command: "false".into(),
            exit_code: 3,
            stderr: String::new(),
        };
        assert_eq!(err.exit_code(), Some(3));
        let err = TransportError::TransferFailed {
            host: "h".into(),
            detail: "x".into(),
        };
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn exec_ok_fails_on_non_zero_exit() {
        let channel = MockChannel::new();
        channel.fail_on("rmmod", 1);
        let host = HostSpec::new("n1", "root", Credentials::Agent);

        assert!(channel.exec_ok(&host, "lsmod").await.is_ok());
        let err = channel.exec_ok(&host, "sudo rmmod nkfs").await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }
}
