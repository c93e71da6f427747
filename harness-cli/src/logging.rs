//! Tracing setup: stdout plus `<artifact-dir>/tests.log`.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log file name inside the artifact directory.
pub const LOG_FILE: &str = "tests.log";

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `-v`.
pub fn init(artifact_dir: &Path, verbose: u8) -> Result<()> {
    std::fs::create_dir_all(artifact_dir).with_context(|| {
        format!("Failed to create artifact directory {}", artifact_dir.display())
    })?;
    let log_path = artifact_dir.join(LOG_FILE);
    let file = File::create(&log_path)
        .with_context(|| format!("Failed to create {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(log = %log_path.display(), "logging initialised");
    Ok(())
}
