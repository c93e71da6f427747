//! Storage-service client.
//!
//! The harness drives the service through two command-line tools: the control
//! binary (`srv_start`, `dev_add`, `neigh_add`, ...) and the data-plane client
//! (`put`, `get`, `delete`). [`ServiceClient`] builds those command lines and runs
//! them over a [`RemoteChannel`]; [`MemoryObjectStore`] stands in for the data
//! plane in tests.

mod memory;

pub use memory::MemoryObjectStore;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::remote::{HostSpec, RemoteChannel, RemoteChannelExt, TransportError};

/// Opaque identifier returned by `put`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as printed by the service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data plane of the storage service.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a local file, returning its object identifier.
    async fn put(&self, path: &Path) -> Result<ObjectId, TransportError>;

    /// Fetch an object into a local file.
    async fn get(&self, id: &ObjectId, out: &Path) -> Result<(), TransportError>;

    /// Delete an object. Deleting an unknown or already deleted id is an error.
    async fn delete(&self, id: &ObjectId) -> Result<(), TransportError>;
}

/// Control plane of the storage service.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Start a server bound to `bind` and advertising `external`.
    async fn start_service(&self, bind: &str, external: &str, port: u16) -> Result<(), TransportError>;

    /// Stop the server bound to `bind`.
    async fn stop_service(&self, bind: &str, port: u16) -> Result<(), TransportError>;

    /// Attach a backing device, optionally reformatting it.
    async fn add_device(&self, path: &str, format: bool) -> Result<(), TransportError>;

    /// Detach a backing device.
    async fn remove_device(&self, path: &str) -> Result<(), TransportError>;

    /// Device status text.
    async fn query_device(&self, path: &str) -> Result<String, TransportError>;

    /// Register a peer.
    async fn add_neighbor(&self, external: &str, port: u16) -> Result<(), TransportError>;

    /// Neighbor table text.
    async fn query_neighbors(&self) -> Result<String, TransportError>;

    /// Flush the in-kernel log buffer to the log file.
    async fn sync_log(&self) -> Result<(), TransportError>;
}

/// Runs the service's control and client binaries on one host.
#[derive(Clone)]
pub struct ServiceClient {
    channel: Arc<dyn RemoteChannel>,
    host: HostSpec,
    checkout: String,
    ctl_binary: String,
    client_binary: String,
    server_address: String,
    port: u16,
    sudo: bool,
    staging: Option<String>,
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("host", &self.host.address)
            .field("checkout", &self.checkout)
            .field("server", &format_args!("{}:{}", self.server_address, self.port))
            .field("staging", &self.staging)
            .finish()
    }
}

impl ServiceClient {
    /// Create a client for the checkout at `checkout` on `host`, talking to the
    /// server at `server_address` and the configured port.
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        host: HostSpec,
        service: &ServiceConfig,
        checkout: impl Into<String>,
        server_address: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            host,
            checkout: checkout.into(),
            ctl_binary: service.ctl_binary.clone(),
            client_binary: service.client_binary.clone(),
            server_address: server_address.into(),
            port: service.port,
            sudo: true,
            staging: None,
        }
    }

    /// Run the control binary through sudo (default: true).
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Stage data-plane files through `dir` on the host: upload before `put`,
    /// download after `get`. Without staging, local paths are passed as-is.
    pub fn with_staging(mut self, dir: impl Into<String>) -> Self {
        self.staging = Some(dir.into());
        self
    }

    /// Host the commands run on.
    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    fn ctl(&self, args: &str) -> String {
        let sudo = if self.sudo { "sudo " } else { "" };
        format!("cd {} && {}{} {}", self.checkout, sudo, self.ctl_binary, args)
    }

    fn cli(&self, verb: &str, args: &str) -> String {
        format!(
            "cd {} && {} {} -s {} -p {} {}",
            self.checkout, self.client_binary, verb, self.server_address, self.port, args
        )
    }

    fn staged_path(&self, dir: &str, name: &str) -> String {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }

    async fn remove_staged(&self, path: &str) {
        if let Err(e) = self.channel.exec(&self.host, &format!("rm -f {}", path)).await {
            tracing::warn!(host = %self.host.address, "failed to remove staged {}: {}", path, e);
        }
    }

    async fn run_put(&self, path: &str) -> Result<ObjectId, TransportError> {
        let command = self.cli("put", &format!("-f {}", path));
        let output = self.channel.exec_ok(&self.host, &command).await?;
        output
            .first_line()
            .map(ObjectId::new)
            .ok_or_else(|| TransportError::MissingOutput {
                host: self.host.address.clone(),
                command,
            })
    }
}

fn local_path(host: &HostSpec, path: &Path) -> Result<String, TransportError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| TransportError::TransferFailed {
            host: host.address.clone(),
            detail: format!("non-UTF-8 path {}", path.display()),
        })
}

#[async_trait]
impl ObjectStore for ServiceClient {
    async fn put(&self, path: &Path) -> Result<ObjectId, TransportError> {
        let Some(dir) = &self.staging else {
            return self.run_put(&local_path(&self.host, path)?).await;
        };
        let staged = self.staged_path(dir, &format!("put-{}", Uuid::new_v4()));
        self.channel.upload(&self.host, path, &staged).await?;
        let result = self.run_put(&staged).await;
        self.remove_staged(&staged).await;
        result
    }

    async fn get(&self, id: &ObjectId, out: &Path) -> Result<(), TransportError> {
        let Some(dir) = &self.staging else {
            let command = self.cli("get", &format!("-f {} -i {}", local_path(&self.host, out)?, id));
            self.channel.exec_ok(&self.host, &command).await?;
            return Ok(());
        };
        let staged = self.staged_path(dir, &format!("get-{}", Uuid::new_v4()));
        let command = self.cli("get", &format!("-f {} -i {}", staged, id));
        let result = match self.channel.exec_ok(&self.host, &command).await {
            Ok(_) => self.channel.download(&self.host, &staged, out).await,
            Err(e) => Err(e),
        };
        self.remove_staged(&staged).await;
        result
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), TransportError> {
        let command = self.cli("delete", &format!("-i {}", id));
        self.channel.exec_ok(&self.host, &command).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for ServiceClient {
    async fn start_service(&self, bind: &str, external: &str, port: u16) -> Result<(), TransportError> {
        let command = self.ctl(&format!("srv_start -b {} -e {} -p {}", bind, external, port));
        self.channel.exec_ok(&self.host, &command).await?;
        Ok(())
    }

    async fn stop_service(&self, bind: &str, port: u16) -> Result<(), TransportError> {
        let command = self.ctl(&format!("srv_stop -b {} -p {}", bind, port));
        self.channel.exec_ok(&self.host, &command).await?;
        Ok(())
    }

    async fn add_device(&self, path: &str, format: bool) -> Result<(), TransportError> {
        let flag = if format { " -f" } else { "" };
        let command = self.ctl(&format!("dev_add -d {}{}", path, flag));
        self.channel.exec_ok(&self.host, &command).await?;
        Ok(())
    }

    async fn remove_device(&self, path: &str) -> Result<(), TransportError> {
        let command = self.ctl(&format!("dev_rem -d {}", path));
        self.channel.exec_ok(&self.host, &command).await?;
        Ok(())
    }

    async fn query_device(&self, path: &str) -> Result<String, TransportError> {
        let command = self.ctl(&format!("dev_query -d {}", path));
        let output = self.channel.exec_ok(&self.host, &command).await?;
        Ok(output.stdout.join("\n"))
    }

    async fn add_neighbor(&self, external: &str, port: u16) -> Result<(), TransportError> {
        let command = self.ctl(&format!("neigh_add -e {} -p {}", external, port));
        self.channel.exec_ok(&self.host, &command).await?;
        Ok(())
    }

    async fn query_neighbors(&self) -> Result<String, TransportError> {
        let output = self.channel.exec_ok(&self.host, &self.ctl("neigh_info")).await?;
        Ok(output.stdout.join("\n"))
    }

    async fn sync_log(&self) -> Result<(), TransportError> {
        self.channel.exec_ok(&self.host, &self.ctl("klog_sync")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Credentials, MockChannel, RecordedCall};

    fn client(channel: &MockChannel) -> ServiceClient {
        ServiceClient::new(
            Arc::new(channel.clone()),
            HostSpec::new("10.0.0.1", "root", Credentials::Agent),
            &ServiceConfig::default(),
            "nkfs",
            "10.0.0.1",
        )
    }

    #[tokio::test]
    async fn control_commands_run_in_checkout_with_sudo() {
        let channel = MockChannel::new();
        let c = client(&channel);

        c.add_device("/dev/sdb", true).await.unwrap();
        c.add_device("/dev/sdc", false).await.unwrap();
        c.start_service("0.0.0.0", "10.0.0.1", 9111).await.unwrap();
        c.add_neighbor("10.0.0.2", 9111).await.unwrap();

        assert_eq!(
            channel.commands_on("10.0.0.1"),
            vec![
                "cd nkfs && sudo bin/nkfs_ctl dev_add -d /dev/sdb -f",
                "cd nkfs && sudo bin/nkfs_ctl dev_add -d /dev/sdc",
                "cd nkfs && sudo bin/nkfs_ctl srv_start -b 0.0.0.0 -e 10.0.0.1 -p 9111",
                "cd nkfs && sudo bin/nkfs_ctl neigh_add -e 10.0.0.2 -p 9111",
            ]
        );
    }

    #[tokio::test]
    async fn sudo_can_be_disabled() {
        let channel = MockChannel::new();
        let c = client(&channel).with_sudo(false);
        c.remove_device("/dev/loop0").await.unwrap();
        assert_eq!(
            channel.commands_on("10.0.0.1"),
            vec!["cd nkfs && bin/nkfs_ctl dev_rem -d /dev/loop0"]
        );
    }

    #[tokio::test]
    async fn query_returns_stdout_text() {
        let channel = MockChannel::new();
        channel.respond("neigh_info", &["neigh 10.0.0.2:9111", "neigh 10.0.0.3:9111"]);
        let text = client(&channel).query_neighbors().await.unwrap();
        assert_eq!(text, "neigh 10.0.0.2:9111\nneigh 10.0.0.3:9111");
    }

    #[tokio::test]
    async fn put_returns_first_stdout_line() {
        let channel = MockChannel::new();
        channel.respond("nkfs_client put", &["", "a1b2c3"]);
        let id = client(&channel).put(Path::new("/tmp/in/f1")).await.unwrap();
        assert_eq!(id.as_str(), "a1b2c3");
        assert_eq!(
            channel.count("nkfs_client put -s 10.0.0.1 -p 9111 -f /tmp/in/f1"),
            1
        );
    }

    #[tokio::test]
    async fn put_without_output_is_missing_output() {
        let channel = MockChannel::new();
        let err = client(&channel).put(Path::new("/tmp/in/f1")).await.unwrap_err();
        assert!(matches!(err, TransportError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn staged_put_uploads_then_cleans_up() {
        let channel = MockChannel::new();
        channel.respond("nkfs_client put", &["obj-1"]);
        let c = client(&channel).with_staging("/root/sshexec/");

        c.put(Path::new("/tmp/in/f1")).await.unwrap();

        let calls = channel.calls();
        let staged = match &calls[0] {
            RecordedCall::Upload { remote, .. } => remote.clone(),
            other => panic!("expected upload first, got {other:?}"),
        };
        assert!(staged.starts_with("/root/sshexec/put-"));
        assert_eq!(channel.count(&format!("put -s 10.0.0.1 -p 9111 -f {}", staged)), 1);
        assert_eq!(channel.count(&format!("rm -f {}", staged)), 1);
    }

    #[tokio::test]
    async fn staged_get_downloads_result() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MockChannel::new();
        let c = client(&channel).with_staging("/root/sshexec");
        let out = dir.path().join("f1");

        c.get(&ObjectId::new("obj-1"), &out).await.unwrap();

        assert!(out.exists());
        assert_eq!(channel.count("nkfs_client get"), 1);
        assert!(channel
            .calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::Download { .. })));
    }

    #[tokio::test]
    async fn failed_delete_is_transport_error() {
        let channel = MockChannel::new();
        channel.fail_on("nkfs_client delete", 2);
        let err = client(&channel)
            .delete(&ObjectId::new("gone"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
    }
}
