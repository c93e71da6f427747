//! Loopback run against one server on the harness host.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use harness_core::cases::FileIntegrityCase;
use harness_core::env::LocalLoopEnv;
use harness_core::remote::LocalChannel;
use harness_core::runner;
use harness_core::suite::TestSuite;
use harness_core::HarnessConfig;

use crate::logging;
use crate::WorkloadArgs;

/// Flags of the `local` command.
#[derive(Debug)]
pub struct LocalOptions {
    pub noloadmods: bool,
    pub bind: Option<String>,
    pub external: Option<String>,
    pub project_dir: Option<PathBuf>,
    pub workload: WorkloadArgs,
}

impl LocalOptions {
    fn apply(&self, config: &mut HarnessConfig) {
        if self.noloadmods {
            config.local.load_modules = false;
        }
        if let Some(bind) = &self.bind {
            config.local.bind_address = bind.clone();
        }
        if let Some(external) = &self.external {
            config.local.external_address = external.clone();
        }
        if let Some(dir) = &self.project_dir {
            config.local.project_dir = dir.clone();
        }
        super::apply_workload(config, &self.workload);
    }
}

/// Run the local command.
pub async fn run(mut config: HarnessConfig, options: LocalOptions, verbose: u8) -> Result<ExitCode> {
    options.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let artifact_dir = config.cluster.artifact_dir.clone();
    logging::init(&artifact_dir, verbose)?;
    tracing::info!(
        "local run: devices {:?}, project {}, load modules {}",
        config.local.devices,
        config.local.project_dir.display(),
        config.local.load_modules
    );

    let cancel = super::interrupt_token();
    let scratch = artifact_dir.join("scratch");
    let mut suite = TestSuite::new();
    suite.add(
        FileIntegrityCase::put_get(config.workload.clone(), &scratch).with_cancellation(cancel.clone()),
    );
    suite.add(
        FileIntegrityCase::put_delete(config.workload.clone(), &scratch).with_cancellation(cancel),
    );

    let mut env = LocalLoopEnv::new(&config, &artifact_dir, Arc::new(LocalChannel::new()));
    let summary = runner::run(&mut env, &mut suite).await;
    Ok(super::exit_code(&summary))
}
