//! Cluster nodes.
//!
//! A [`ClusterNode`] is one machine under test: its identity plus the lifecycle
//! operations the harness runs on it (provision, start, register neighbors,
//! query, stop, collect logs). Every operation is a sequence of remote commands;
//! none are retried.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Instrument;

use crate::client::{ServiceClient, ServiceControl};
use crate::config::ServiceConfig;
use crate::error::{HarnessError, Result};
use crate::remote::{Credentials, HostSpec, RemoteChannel, RemoteChannelExt, TransportError};

/// Immutable identity of one machine under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Host name or IP address; also the address peers and clients use.
    pub address: String,
    /// Login user.
    pub user: String,
    /// Authentication method.
    pub credentials: Credentials,
    /// Backing devices attached at start.
    pub devices: Vec<String>,
    /// Local directory receiving this node's artifacts.
    pub local_dir: PathBuf,
    /// Scratch directory on the node.
    pub remote_dir: String,
}

impl NodeIdentity {
    /// Build an identity. Artifacts go to `<artifact_root>/node_<address>`.
    pub fn new(
        address: impl Into<String>,
        user: impl Into<String>,
        credentials: Credentials,
        devices: Vec<String>,
        artifact_root: &Path,
    ) -> Self {
        let address = address.into();
        let user = user.into();
        let remote_dir = if user == "root" {
            "/root/sshexec".to_string()
        } else {
            format!("/home/{}/sshexec", user)
        };
        Self {
            local_dir: artifact_root.join(format!("node_{}", address)),
            address,
            user,
            credentials,
            devices,
            remote_dir,
        }
    }

    /// Host spec for the remote channel.
    pub fn host(&self) -> HostSpec {
        HostSpec::new(self.address.clone(), self.user.clone(), self.credentials.clone())
    }
}

/// Read-only diagnostics gathered by [`ClusterNode::query_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    /// `(device, status text)` for every device that answered.
    pub devices: Vec<(String, String)>,
    /// Neighbor table, if the query succeeded.
    pub neighbors: Option<String>,
}

/// One machine under test.
pub struct ClusterNode {
    identity: NodeIdentity,
    host: HostSpec,
    channel: Arc<dyn RemoteChannel>,
    service: ServiceConfig,
    client: ServiceClient,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("identity", &self.identity)
            .finish()
    }
}

impl ClusterNode {
    /// Create a node. Nothing runs until a lifecycle operation is called.
    pub fn new(identity: NodeIdentity, channel: Arc<dyn RemoteChannel>, service: ServiceConfig) -> Self {
        let host = identity.host();
        let client = ServiceClient::new(
            channel.clone(),
            host.clone(),
            &service,
            service.checkout_dir.clone(),
            identity.address.clone(),
        )
        .with_staging(identity.remote_dir.clone());
        Self {
            identity,
            host,
            channel,
            service,
            client,
        }
    }

    /// Node identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Node address.
    pub fn address(&self) -> &str {
        &self.identity.address
    }

    /// Service client bound to this node, staging data through its scratch dir.
    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    fn span(&self, phase: &'static str) -> tracing::Span {
        tracing::info_span!("node", address = %self.identity.address, phase)
    }

    async fn run(&self, command: &str) -> std::result::Result<(), TransportError> {
        self.channel.exec_ok(&self.host, command).await.map(|_| ())
    }

    fn in_checkout(&self, command: &str) -> String {
        format!("cd {} && {}", self.service.checkout_dir, command)
    }

    async fn cpu_count(&self) -> usize {
        match self.channel.exec_logged(&self.host, "nproc").await {
            Ok(out) if out.success() => out
                .first_line()
                .and_then(|l| l.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(1),
            _ => 1,
        }
    }

    /// Fetch and build the service from source.
    pub async fn provision(&self) -> Result<()> {
        async {
            let steps = async {
                self.run(&format!("mkdir -p {}", self.identity.remote_dir)).await?;
                let jobs = self.cpu_count().await;
                self.run(&format!("sudo rm -rf {}", self.service.log_path)).await?;
                self.run(&format!("rm -rf {}", self.service.checkout_dir)).await?;
                self.run(&format!(
                    "git clone --branch {} {} {}",
                    self.service.branch, self.service.repo_url, self.service.checkout_dir
                ))
                .await?;
                self.run(&self.in_checkout(&format!("make -j {}", jobs))).await
            };
            steps.await.map_err(|source| HarnessError::Provision {
                node: self.identity.address.clone(),
                source,
            })
        }
        .instrument(self.span("provision"))
        .await
    }

    /// Load modules, attach devices and start the server.
    pub async fn start_service(&self, bind: &str, external: &str, port: u16) -> Result<()> {
        async {
            let steps = async {
                if self.service.flush_firewall {
                    self.run("sudo iptables -F").await?;
                }
                for module in &self.service.modules {
                    self.run(&self.in_checkout(&format!(
                        "sudo insmod {}/{}.ko",
                        self.service.module_dir, module
                    )))
                    .await?;
                }
                for device in &self.identity.devices {
                    self.client.add_device(device, self.service.format_devices).await?;
                }
                self.client.start_service(bind, external, port).await
            };
            steps.await.map_err(|source| HarnessError::Start {
                node: self.identity.address.clone(),
                source,
            })
        }
        .instrument(self.span("start"))
        .await
    }

    /// Register one peer with this node's server.
    ///
    /// Not idempotent: registering the same peer twice may duplicate it.
    pub async fn add_neighbor(&self, peer: &str, port: u16) -> Result<()> {
        self.client
            .add_neighbor(peer, port)
            .instrument(self.span("mesh"))
            .await
            .map_err(|source| HarnessError::Registration {
                node: self.identity.address.clone(),
                peer: peer.to_string(),
                source,
            })
    }

    /// Query device and neighbor status. Failures are logged, never returned.
    pub async fn query_status(&self) -> NodeStatus {
        async {
            let mut status = NodeStatus::default();
            for device in &self.identity.devices {
                match self.client.query_device(device).await {
                    Ok(text) => status.devices.push((device.clone(), text)),
                    Err(e) => tracing::warn!("dev_query {} failed: {}", device, e),
                }
            }
            match self.client.query_neighbors().await {
                Ok(text) => status.neighbors = Some(text),
                Err(e) => tracing::warn!("neigh_info failed: {}", e),
            }
            status
        }
        .instrument(self.span("query"))
        .await
    }

    /// Unload the service modules in reverse load order.
    ///
    /// Stops at the first failure, since the remaining modules are still in use.
    pub async fn stop_service(&self) -> Result<()> {
        async {
            for module in self.service.modules.iter().rev() {
                self.run(&format!("sudo rmmod {}", module))
                    .await
                    .map_err(|source| HarnessError::Stop {
                        node: self.identity.address.clone(),
                        source,
                    })?;
            }
            Ok::<_, HarnessError>(())
        }
        .instrument(self.span("stop"))
        .await
    }

    /// Flush the service log and download it with the kernel log into `local_dir`.
    pub async fn collect_logs(&self, local_dir: &Path) -> Result<()> {
        async {
            let remote_log = format!("{}/nkfs.log", self.identity.remote_dir);
            let remote_dmesg = format!("{}/dmesg.out", self.identity.remote_dir);

            let steps = async {
                self.run(&format!("mkdir -p {}", self.identity.remote_dir)).await?;
                if let Err(e) = self.client.sync_log().await {
                    tracing::warn!("klog_sync failed, collecting unflushed log: {}", e);
                }
                self.run(&format!("sudo cp {} {}", self.service.log_path, remote_log)).await?;
                self.run(&format!("sudo dmesg > {}", remote_dmesg)).await?;
                self.run(&format!(
                    "sudo chown -R {user}:{user} {}",
                    self.identity.remote_dir,
                    user = self.identity.user
                ))
                .await?;
                tokio::fs::create_dir_all(local_dir).await?;
                self.channel
                    .download(&self.host, &remote_log, &local_dir.join("nkfs.log"))
                    .await?;
                self.channel
                    .download(&self.host, &remote_dmesg, &local_dir.join("dmesg.out"))
                    .await
            };
            steps.await.map_err(|source| HarnessError::LogCollection {
                node: self.identity.address.clone(),
                source,
            })
        }
        .instrument(self.span("logs"))
        .await
    }
}

/// Ordered set of nodes with unique addresses.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: Vec<Arc<ClusterNode>>,
}

impl NodeSet {
    /// Build a set, rejecting duplicate addresses.
    pub fn new(nodes: Vec<ClusterNode>) -> Result<Self> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.address().to_string()) {
                return Err(HarnessError::InvalidConfig(format!(
                    "duplicate node address {}",
                    node.address()
                )));
            }
        }
        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
        })
    }

    /// Build one node per address, all sharing a channel, login and device list.
    pub fn from_addresses(
        addresses: &[String],
        user: &str,
        credentials: &Credentials,
        devices: &[String],
        artifact_root: &Path,
        channel: Arc<dyn RemoteChannel>,
        service: &ServiceConfig,
    ) -> Result<Self> {
        let nodes = addresses
            .iter()
            .map(|address| {
                let identity = NodeIdentity::new(
                    address.clone(),
                    user,
                    credentials.clone(),
                    devices.to_vec(),
                    artifact_root,
                );
                ClusterNode::new(identity, channel.clone(), service.clone())
            })
            .collect();
        Self::new(nodes)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[Arc<ClusterNode>] {
        &self.nodes
    }

    /// Iterate over the nodes.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClusterNode>> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the set has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node addresses in insertion order.
    pub fn addresses(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.address()).collect()
    }

    /// Look up a node by address.
    pub fn get(&self, address: &str) -> Option<&Arc<ClusterNode>> {
        self.nodes.iter().find(|n| n.address() == address)
    }
}
