//! Configuration loading for the harness.
//!
//! Configuration is loaded from an optional TOML file; every field has a default so
//! an empty file (or no file) gives the stock nkfs setup. The resulting struct is
//! passed into each component at construction.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::HarnessError;
use crate::mesh::Registration;
use crate::workload::WorkloadSpec;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarnessConfig {
    /// How to build, start and talk to the nkfs service.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Cluster runs.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Integrity workload parameters.
    #[serde(default)]
    pub workload: WorkloadSpec,
    /// Local loopback runs.
    #[serde(default)]
    pub local: LocalConfig,
}

/// nkfs service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service port (default: 9111).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address the server binds to on cluster nodes (default: 0.0.0.0).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Git repository to build from.
    #[serde(default = "default_repo_url")]
    pub repo_url: String,
    /// Branch to check out.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Checkout directory, relative to the login user's home.
    #[serde(default = "default_checkout_dir")]
    pub checkout_dir: String,
    /// Kernel modules in load order; unloaded in reverse.
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
    /// Directory holding built `.ko` files, relative to the checkout.
    #[serde(default = "default_module_dir")]
    pub module_dir: String,
    /// Control binary, relative to the checkout.
    #[serde(default = "default_ctl_binary")]
    pub ctl_binary: String,
    /// Data-plane client binary, relative to the checkout.
    #[serde(default = "default_client_binary")]
    pub client_binary: String,
    /// Service log file on the node.
    #[serde(default = "default_log_path")]
    pub log_path: String,
    /// Reformat backing devices when attaching them (default: true).
    #[serde(default = "default_true")]
    pub format_devices: bool,
    /// Flush iptables before starting so nodes can reach each other (default: true).
    #[serde(default = "default_true")]
    pub flush_firewall: bool,
}

/// Cluster run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Seconds to wait after mesh registration for heartbeats to converge (default: 20).
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Neighbor registration direction (default: one-way).
    #[serde(default)]
    pub registration: Registration,
    /// Local directory receiving logs and per-node artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// SSH connection timeout in seconds (default: 30).
    #[serde(default = "default_ssh_timeout")]
    pub ssh_connect_timeout_secs: u64,
}

/// Local loopback run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Address the server binds to (default: 127.0.0.1).
    #[serde(default = "default_local_address")]
    pub bind_address: String,
    /// Address the server advertises and clients connect to (default: 127.0.0.1).
    #[serde(default = "default_local_address")]
    pub external_address: String,
    /// Backing devices to attach.
    #[serde(default = "default_local_devices")]
    pub devices: Vec<String>,
    /// Load kernel modules before the run and unload after (default: true).
    #[serde(default = "default_true")]
    pub load_modules: bool,
    /// Create loop devices from sparse backing files (default: true).
    #[serde(default = "default_true")]
    pub create_loop_devices: bool,
    /// Size of each loop backing file in bytes (default: 1 GiB).
    #[serde(default = "default_loop_file_size")]
    pub loop_file_size: u64,
    /// nkfs source tree holding `bin/` (default: current directory).
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    /// Run privileged commands through sudo (default: true).
    #[serde(default = "default_true")]
    pub use_sudo: bool,
}

// Default value functions
fn default_port() -> u16 {
    9111
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_repo_url() -> String {
    "https://github.com/irqlevel/nkfs.git".to_string()
}

fn default_branch() -> String {
    "devel".to_string()
}

fn default_checkout_dir() -> String {
    "nkfs".to_string()
}

fn default_modules() -> Vec<String> {
    vec!["nkfs_crt".to_string(), "nkfs".to_string()]
}

fn default_module_dir() -> String {
    "bin".to_string()
}

fn default_ctl_binary() -> String {
    "bin/nkfs_ctl".to_string()
}

fn default_client_binary() -> String {
    "bin/nkfs_client".to_string()
}

fn default_log_path() -> String {
    "/var/log/nkfs.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_settle_secs() -> u64 {
    20
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("cluster_test")
}

fn default_ssh_timeout() -> u64 {
    crate::remote::DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_local_devices() -> Vec<String> {
    (0..3).map(|i| format!("/dev/loop{}", i)).collect()
}

fn default_loop_file_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB, sparse
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            repo_url: default_repo_url(),
            branch: default_branch(),
            checkout_dir: default_checkout_dir(),
            modules: default_modules(),
            module_dir: default_module_dir(),
            ctl_binary: default_ctl_binary(),
            client_binary: default_client_binary(),
            log_path: default_log_path(),
            format_devices: default_true(),
            flush_firewall: default_true(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            settle_secs: default_settle_secs(),
            registration: Registration::default(),
            artifact_dir: default_artifact_dir(),
            ssh_connect_timeout_secs: default_ssh_timeout(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_address: default_local_address(),
            external_address: default_local_address(),
            devices: default_local_devices(),
            load_modules: default_true(),
            create_loop_devices: default_true(),
            loop_file_size: default_loop_file_size(),
            project_dir: default_project_dir(),
            use_sudo: default_true(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.service.port == 0 {
            return Err(HarnessError::InvalidConfig("service.port must be non-zero".into()));
        }
        if self.service.modules.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "service.modules must list at least one module".into(),
            ));
        }
        self.workload.validate()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
