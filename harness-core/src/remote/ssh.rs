//! SSH execution primitives.
//!
//! Uses `tokio::process::Command` to shell out to `ssh` and `scp`.
//! Password logins go through `sshpass -e`, which reads the password from the
//! `SSHPASS` environment variable so it never shows up in a process listing.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CommandOutput, Credentials, HostSpec, RemoteChannel, TransportError};

/// Default SSH connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// [`RemoteChannel`] backed by the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct SshChannel {
    connect_timeout_secs: u64,
}

impl Default for SshChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT_SECS)
    }
}

impl SshChannel {
    /// Create a channel with the given connection timeout.
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
        }
    }

    /// Build the command for `program` (ssh or scp) with auth and connection options.
    fn command(&self, program: &str, host: &HostSpec) -> Command {
        let mut cmd = match &host.credentials {
            Credentials::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password).arg("-e").arg(program);
                cmd
            }
            _ => Command::new(program),
        };
        cmd.args(self.options(host));
        cmd
    }

    fn options(&self, host: &HostSpec) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        match &host.credentials {
            Credentials::Agent => {
                opts.push("-o".into());
                opts.push("BatchMode=yes".into());
            }
            Credentials::KeyFile(path) => {
                opts.push("-i".into());
                opts.push(path.display().to_string());
                opts.push("-o".into());
                opts.push("BatchMode=yes".into());
            }
            Credentials::Password(_) => {}
        }
        opts
    }

    async fn scp(&self, host: &HostSpec, from: &str, to: &str) -> Result<(), TransportError> {
        let output = self.command("scp", host).arg(from).arg(to).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::TransferFailed {
                host: host.address.clone(),
                detail: format!("scp {} -> {} failed: {}", from, to, stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, host: &HostSpec, command: &str) -> Result<CommandOutput, TransportError> {
        let output = self
            .command("ssh", host)
            .arg(host.login())
            .arg(command)
            .output()
            .await?;

        Ok(CommandOutput::from_raw(
            output.status.code().unwrap_or(-1),
            &output.stdout,
            &output.stderr,
        ))
    }

    async fn upload(&self, host: &HostSpec, local: &Path, remote: &str) -> Result<(), TransportError> {
        tracing::info!(host = %host.address, "upload {} -> {}", local.display(), remote);
        let target = format!("{}:{}", host.login(), remote);
        self.scp(host, &local.display().to_string(), &target).await
    }

    async fn download(&self, host: &HostSpec, remote: &str, local: &Path) -> Result<(), TransportError> {
        tracing::info!(host = %host.address, "download {} -> {}", remote, local.display());
        let source = format!("{}:{}", host.login(), remote);
        self.scp(host, &source, &local.display().to_string()).await
    }
}
