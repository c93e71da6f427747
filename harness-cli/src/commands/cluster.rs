//! Remote cluster run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use harness_core::cases::FileIntegrityCase;
use harness_core::env::ClusterEnv;
use harness_core::mesh::Registration;
use harness_core::node::NodeSet;
use harness_core::remote::{Credentials, SshChannel};
use harness_core::runner;
use harness_core::suite::TestSuite;
use harness_core::HarnessConfig;
use tokio_util::sync::CancellationToken;

use crate::logging;
use crate::WorkloadArgs;

/// Flags of the `cluster` command.
#[derive(Debug)]
pub struct ClusterOptions {
    pub addresses: Vec<String>,
    pub devices: Vec<String>,
    pub user: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub settle_secs: Option<u64>,
    pub bidirectional: bool,
    pub skip_workloads: bool,
    pub workload: WorkloadArgs,
}

impl ClusterOptions {
    fn credentials(&self) -> Credentials {
        match (&self.password, &self.key_file) {
            (Some(password), _) => Credentials::Password(password.clone()),
            (None, Some(key)) => Credentials::KeyFile(key.clone()),
            (None, None) => Credentials::Agent,
        }
    }

    /// Workload runs need a backing device on every node.
    fn check_devices(&self) -> Result<()> {
        if self.devices.is_empty() && !self.skip_workloads {
            anyhow::bail!("At least one --device is required unless --skip-workloads is given");
        }
        Ok(())
    }

    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(secs) = self.settle_secs {
            config.cluster.settle_secs = secs;
        }
        if self.bidirectional {
            config.cluster.registration = Registration::Bidirectional;
        }
        super::apply_workload(config, &self.workload);
    }
}

/// Build the integrity suite; empty in smoke mode.
fn build_suite(
    config: &HarnessConfig,
    skip_workloads: bool,
    cancel: &CancellationToken,
) -> TestSuite {
    let mut suite = TestSuite::new();
    if skip_workloads {
        return suite;
    }
    let scratch = config.cluster.artifact_dir.join("scratch");
    suite.add(
        FileIntegrityCase::put_get(config.workload.clone(), &scratch).with_cancellation(cancel.clone()),
    );
    suite.add(
        FileIntegrityCase::put_delete(config.workload.clone(), &scratch)
            .with_cancellation(cancel.clone()),
    );
    suite
}

/// Run the cluster command.
pub async fn run(mut config: HarnessConfig, options: ClusterOptions, verbose: u8) -> Result<ExitCode> {
    options.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    options.check_devices()?;

    let artifact_dir = config.cluster.artifact_dir.clone();
    logging::init(&artifact_dir, verbose)?;
    tracing::info!(
        "cluster run: nodes {:?}, devices {:?}, artifacts {}",
        options.addresses,
        options.devices,
        artifact_dir.display()
    );

    let channel = Arc::new(SshChannel::new(config.cluster.ssh_connect_timeout_secs));
    let nodes = NodeSet::from_addresses(
        &options.addresses,
        &options.user,
        &options.credentials(),
        &options.devices,
        &artifact_dir,
        channel,
        &config.service,
    )
    .context("Invalid node list")?;

    let cancel = super::interrupt_token();
    let mut env = ClusterEnv::new(nodes, &config)?.with_cancellation(cancel.clone());
    let mut suite = build_suite(&config, options.skip_workloads, &cancel);

    let summary = runner::run(&mut env, &mut suite).await;
    Ok(super::exit_code(&summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ClusterOptions {
        ClusterOptions {
            addresses: vec!["10.0.0.1".into()],
            devices: Vec::new(),
            user: "root".into(),
            password: None,
            key_file: None,
            settle_secs: None,
            bidirectional: false,
            skip_workloads: false,
            workload: WorkloadArgs::default(),
        }
    }

    #[test]
    fn credentials_from_flags() {
        let mut opts = options();
        assert!(matches!(opts.credentials(), Credentials::Agent));
        opts.key_file = Some(PathBuf::from("/root/.ssh/id"));
        assert!(matches!(opts.credentials(), Credentials::KeyFile(_)));
        opts.password = Some("secret".into());
        assert!(matches!(opts.credentials(), Credentials::Password(ref p) if p == "secret"));
    }

    #[test]
    fn flags_override_config() {
        let mut opts = options();
        opts.settle_secs = Some(0);
        opts.bidirectional = true;
        let mut config = HarnessConfig::default();
        opts.apply(&mut config);
        assert_eq!(config.cluster.settle_secs, 0);
        assert_eq!(config.cluster.registration, Registration::Bidirectional);
    }

    #[test]
    fn smoke_mode_has_no_cases() {
        let config = HarnessConfig::default();
        let cancel = CancellationToken::new();
        assert!(build_suite(&config, true, &cancel).is_empty());
        assert_eq!(build_suite(&config, false, &cancel).len(), 2);
    }

    #[test]
    fn workloads_need_a_device() {
        let mut opts = options();
        assert!(opts.check_devices().is_err());
        opts.skip_workloads = true;
        assert!(opts.check_devices().is_ok());
        opts.skip_workloads = false;
        opts.devices = vec!["/dev/sdb".into()];
        assert!(opts.check_devices().is_ok());
    }
}
