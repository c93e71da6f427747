//! Local shell channel for loopback runs.
//!
//! Commands run under `sh -c` on the harness host; the host spec is only used
//! for logging. Transfers are plain file copies.

use std::path::Path;

use async_trait::async_trait;

use super::{CommandOutput, HostSpec, RemoteChannel, TransportError};

/// [`RemoteChannel`] that executes on the local machine.
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

impl LocalChannel {
    /// Create a local channel.
    pub fn new() -> Self {
        Self
    }

    async fn copy(host: &HostSpec, from: &Path, to: &Path) -> Result<(), TransportError> {
        let failed = |e: std::io::Error| TransportError::TransferFailed {
            host: host.address.clone(),
            detail: format!("copy {} -> {} failed: {}", from.display(), to.display(), e),
        };
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        tokio::fs::copy(from, to).await.map_err(failed)?;
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    async fn exec(&self, _host: &HostSpec, command: &str) -> Result<CommandOutput, TransportError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
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
        Self::copy(host, local, Path::new(remote)).await
    }

    async fn download(&self, host: &HostSpec, remote: &str, local: &Path) -> Result<(), TransportError> {
        Self::copy(host, Path::new(remote), local).await
    }
}
