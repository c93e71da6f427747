//! Shared test fixtures.
//!
//! An [`Environment`] owns the service instances and backing devices that test
//! cases run against. `prepare` brings them up and stops at the first failure;
//! `cleanup` tears down whatever was actually brought up, with every step
//! best-effort, so it is safe after a partial `prepare`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::{ObjectStore, ServiceClient, ServiceControl};
use crate::config::{ClusterConfig, HarnessConfig, LocalConfig, ServiceConfig};
use crate::error::{HarnessError, Result};
use crate::executor::{attempt, best_effort, ParallelExecutor, Task};
use crate::mesh::MeshTopologyBuilder;
use crate::node::NodeSet;
use crate::remote::{Credentials, HostSpec, RemoteChannel, RemoteChannelExt, TransportError};

/// Fixture shared by the cases of one suite.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Bring up services and devices.
    async fn prepare(&mut self) -> Result<()>;

    /// Tear down what `prepare` brought up. Never fails; errors are logged.
    async fn cleanup(&mut self);

    /// Data-plane store for workload worker `worker`.
    fn store(&self, worker: usize) -> Arc<dyn ObjectStore>;

    /// Number of worker groups a workload runs; each group has
    /// `workload.workers` workers. Cluster runs use one group per node.
    fn worker_groups(&self) -> usize {
        1
    }

    /// Log device and neighbor status. Never fails.
    async fn query_status(&self);
}

/// One server with loop-backed devices on the harness host.
pub struct LocalLoopEnv {
    local: LocalConfig,
    service: ServiceConfig,
    channel: Arc<dyn RemoteChannel>,
    host: HostSpec,
    client: ServiceClient,
    loop_dir: PathBuf,
    loaded_modules: Vec<String>,
    loop_devices: Vec<(String, PathBuf)>,
    server_started: bool,
    added_devices: Vec<String>,
}

impl std::fmt::Debug for LocalLoopEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLoopEnv")
            .field("devices", &self.local.devices)
            .field("loaded_modules", &self.loaded_modules)
            .field("server_started", &self.server_started)
            .field("added_devices", &self.added_devices)
            .finish()
    }
}

impl LocalLoopEnv {
    /// Create the environment; loop backing files go under `<artifact_dir>/loop`.
    pub fn new(config: &HarnessConfig, artifact_dir: &Path, channel: Arc<dyn RemoteChannel>) -> Self {
        let local = config.local.clone();
        let host = HostSpec::new(local.external_address.clone(), "local", Credentials::Agent);
        let checkout = local.project_dir.display().to_string();
        let client = ServiceClient::new(
            channel.clone(),
            host.clone(),
            &config.service,
            checkout,
            local.external_address.clone(),
        )
        .with_sudo(local.use_sudo);
        Self {
            loop_dir: artifact_dir.join("loop"),
            local,
            service: config.service.clone(),
            channel,
            host,
            client,
            loaded_modules: Vec::new(),
            loop_devices: Vec::new(),
            server_started: false,
            added_devices: Vec::new(),
        }
    }

    fn privileged(&self, command: &str) -> String {
        if self.local.use_sudo {
            format!("sudo {}", command)
        } else {
            command.to_string()
        }
    }

    async fn run(&self, command: &str) -> std::result::Result<(), TransportError> {
        self.channel.exec_ok(&self.host, command).await.map(|_| ())
    }

    fn start_error(&self, source: TransportError) -> HarnessError {
        HarnessError::Start {
            node: self.host.address.clone(),
            source,
        }
    }

    async fn load_modules(&mut self) -> Result<()> {
        for module in self.service.modules.clone() {
            let command = format!(
                "cd {} && {}",
                self.local.project_dir.display(),
                self.privileged(&format!("insmod {}/{}.ko", self.service.module_dir, module))
            );
            self.run(&command).await.map_err(|e| self.start_error(e))?;
            self.loaded_modules.push(module);
        }
        Ok(())
    }

    async fn create_loop_devices(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.loop_dir).await?;
        for device in self.local.devices.clone() {
            let name = device.rsplit('/').next().unwrap_or(device.as_str());
            let backing = self.loop_dir.join(format!("{}.img", name));
            let steps = async {
                self.run(&format!("truncate -s {} {}", self.local.loop_file_size, backing.display()))
                    .await?;
                self.run(&self.privileged(&format!("losetup {} {}", device, backing.display())))
                    .await
            };
            steps.await.map_err(|e| self.start_error(e))?;
            self.loop_devices.push((device, backing));
        }
        Ok(())
    }
}

#[async_trait]
impl Environment for LocalLoopEnv {
    fn name(&self) -> &str {
        "local-loop"
    }

    async fn prepare(&mut self) -> Result<()> {
        if self.local.load_modules {
            self.load_modules().await?;
        }
        if self.local.create_loop_devices {
            self.create_loop_devices().await?;
        }

        self.server_started = true;
        self.client
            .start_service(&self.local.bind_address, &self.local.external_address, self.service.port)
            .await
            .map_err(|e| self.start_error(e))?;

        for device in self.local.devices.clone() {
            self.client
                .add_device(&device, true)
                .await
                .map_err(|e| self.start_error(e))?;
            self.added_devices.push(device);
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        if std::mem::take(&mut self.server_started) {
            attempt("stop server", async {
                self.client
                    .stop_service(&self.local.bind_address, self.service.port)
                    .await
                    .map_err(HarnessError::from)
            })
            .await;
        }

        for device in std::mem::take(&mut self.added_devices).into_iter().rev() {
            attempt(&format!("remove {}", device), async {
                self.client.remove_device(&device).await.map_err(HarnessError::from)
            })
            .await;
        }

        for module in std::mem::take(&mut self.loaded_modules).into_iter().rev() {
            let command = self.privileged(&format!("rmmod {}", module));
            attempt(&format!("unload {}", module), async {
                self.run(&command).await.map_err(HarnessError::from)
            })
            .await;
        }

        for (device, backing) in std::mem::take(&mut self.loop_devices).into_iter().rev() {
            let command = self.privileged(&format!("losetup -d {}", device));
            attempt(&format!("detach {}", device), async {
                self.run(&command).await.map_err(HarnessError::from)
            })
            .await;
            attempt(&format!("remove {}", backing.display()), async {
                tokio::fs::remove_file(&backing).await.map_err(HarnessError::from)
            })
            .await;
        }
    }

    fn store(&self, _worker: usize) -> Arc<dyn ObjectStore> {
        Arc::new(self.client.clone())
    }

    async fn query_status(&self) {
        for device in &self.added_devices {
            match self.client.query_device(device).await {
                Ok(text) => tracing::info!("{}: {}", device, text),
                Err(e) => tracing::warn!("dev_query {} failed: {}", device, e),
            }
        }
    }
}

/// Remote nodes connected into a full mesh.
#[derive(Debug)]
pub struct ClusterEnv {
    nodes: NodeSet,
    service: ServiceConfig,
    cluster: ClusterConfig,
    started: HashSet<String>,
    cancel: Option<CancellationToken>,
}

impl ClusterEnv {
    /// Create the environment over a non-empty node set.
    pub fn new(nodes: NodeSet, config: &HarnessConfig) -> Result<Self> {
        if nodes.is_empty() {
            return Err(HarnessError::InvalidConfig("cluster needs at least one node".into()));
        }
        Ok(Self {
            nodes,
            service: config.service.clone(),
            cluster: config.cluster.clone(),
            started: HashSet::new(),
            cancel: None,
        })
    }

    /// Make the setup phases abortable. Teardown ignores the token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Nodes under test.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    fn executor(&self, phase: &str) -> ParallelExecutor {
        let executor = ParallelExecutor::new(phase);
        match &self.cancel {
            Some(token) => executor.with_cancellation(token.clone()),
            None => executor,
        }
    }

    async fn settle(&self) -> Result<()> {
        let wait = Duration::from_secs(self.cluster.settle_secs);
        tracing::info!("waiting {:?} for heartbeats to settle", wait);
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(HarnessError::Cancelled { phase: "settle".into() }),
                _ = tokio::time::sleep(wait) => Ok(()),
            },
            None => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Environment for ClusterEnv {
    fn name(&self) -> &str {
        "cluster"
    }

    async fn prepare(&mut self) -> Result<()> {
        let provision = self
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                Task::new(node.address().to_string(), async move { node.provision().await })
            })
            .collect();
        self.executor("provision").run(provision).await?;

        let bind = self.service.bind_address.clone();
        let port = self.service.port;
        self.started
            .extend(self.nodes.addresses().into_iter().map(str::to_string));
        let start = self
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                let bind = bind.clone();
                Task::new(node.address().to_string(), async move {
                    let external = node.address().to_string();
                    node.start_service(&bind, &external, port).await
                })
            })
            .collect();
        self.executor("start").run(start).await?;

        MeshTopologyBuilder::new(port)
            .with_registration(self.cluster.registration)
            .connect(&self.nodes)
            .await?;

        self.settle().await?;
        self.query_status().await;
        Ok(())
    }

    async fn cleanup(&mut self) {
        let collect = self
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                Task::new(node.address().to_string(), async move {
                    let local_dir = node.identity().local_dir.clone();
                    node.collect_logs(&local_dir).await
                })
            })
            .collect();
        best_effort("collect-logs", collect).await;

        let stop = self
            .nodes
            .iter()
            .filter(|node| self.started.contains(node.address()))
            .map(|node| {
                let node = node.clone();
                Task::new(node.address().to_string(), async move { node.stop_service().await })
            })
            .collect();
        best_effort("stop", stop).await;
        self.started.clear();
    }

    fn store(&self, worker: usize) -> Arc<dyn ObjectStore> {
        let node = &self.nodes.nodes()[worker % self.nodes.len()];
        Arc::new(node.client().clone())
    }

    fn worker_groups(&self) -> usize {
        self.nodes.len()
    }

    async fn query_status(&self) {
        let query = self
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                Task::new(node.address().to_string(), async move {
                    let status = node.query_status().await;
                    for (device, text) in &status.devices {
                        tracing::info!(address = %node.address(), "{}: {}", device, text);
                    }
                    if let Some(neighbors) = &status.neighbors {
                        tracing::info!(address = %node.address(), "neighbors: {}", neighbors);
                    }
                    Ok::<_, HarnessError>(())
                })
            })
            .collect();
        best_effort("query", query).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockChannel;

    fn local_env(channel: &MockChannel, dir: &Path) -> LocalLoopEnv {
        let mut config = HarnessConfig::default();
        config.local.project_dir = PathBuf::from("/src/nkfs");
        config.local.devices = vec!["/dev/loop0".into(), "/dev/loop1".into()];
        config.local.loop_file_size = 4096;
        LocalLoopEnv::new(&config, dir, Arc::new(channel.clone()))
    }

    #[tokio::test]
    async fn local_prepare_then_cleanup_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MockChannel::new();
        let mut env = local_env(&channel, dir.path());

        env.prepare().await.unwrap();
        let backing = dir.path().join("loop/loop0.img").display().to_string();
        assert_eq!(channel.count("sudo insmod bin/nkfs_crt.ko"), 1);
        assert_eq!(channel.count(&format!("truncate -s 4096 {}", backing)), 1);
        assert_eq!(
            channel.count("srv_start -b 127.0.0.1 -e 127.0.0.1 -p 9111"),
            1
        );
        assert_eq!(channel.count("dev_add -d /dev/loop1 -f"), 1);

        let before = channel.calls().len();
        env.cleanup().await;
        let teardown: Vec<String> = channel.commands_on("127.0.0.1").split_off(before);
        assert_eq!(
            teardown,
            vec![
                "cd /src/nkfs && sudo bin/nkfs_ctl srv_stop -b 127.0.0.1 -p 9111",
                "cd /src/nkfs && sudo bin/nkfs_ctl dev_rem -d /dev/loop1",
                "cd /src/nkfs && sudo bin/nkfs_ctl dev_rem -d /dev/loop0",
                "sudo rmmod nkfs",
                "sudo rmmod nkfs_crt",
                "sudo losetup -d /dev/loop1",
                "sudo losetup -d /dev/loop0",
            ]
        );
    }

    #[tokio::test]
    async fn local_cleanup_after_partial_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MockChannel::new();
        channel.fail_on("losetup /dev/loop1", 1);
        let mut env = local_env(&channel, dir.path());

        assert!(env.prepare().await.is_err());
        assert_eq!(channel.count("srv_start"), 0);

        env.cleanup().await;
        assert_eq!(channel.count("srv_stop"), 0);
        assert_eq!(channel.count("dev_rem"), 0);
        assert_eq!(channel.count("rmmod"), 2);
        assert_eq!(channel.count("losetup -d /dev/loop0"), 1);
        assert_eq!(channel.count("losetup -d /dev/loop1"), 0);
    }

    #[tokio::test]
    async fn local_cleanup_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MockChannel::new();
        let mut env = local_env(&channel, dir.path());
        env.prepare().await.unwrap();

        channel.fail_on("srv_stop", 1);
        channel.fail_on("dev_rem", 1);
        env.cleanup().await;
        assert_eq!(channel.count("rmmod"), 2);
        assert_eq!(channel.count("losetup -d"), 2);
    }

    #[tokio::test]
    async fn noloadmods_skips_module_handling() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MockChannel::new();
        let mut config = HarnessConfig::default();
        config.local.load_modules = false;
        config.local.create_loop_devices = false;
        let mut env = LocalLoopEnv::new(&config, dir.path(), Arc::new(channel.clone()));

        env.prepare().await.unwrap();
        env.cleanup().await;
        assert_eq!(channel.count("insmod"), 0);
        assert_eq!(channel.count("rmmod"), 0);
        assert_eq!(channel.count("losetup"), 0);
        assert_eq!(channel.count("dev_add"), 3);
    }
}
