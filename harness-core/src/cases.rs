//! The integrity test cases: put+get with verification, and put+delete.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::env::Environment;
use crate::error::Result;
use crate::suite::{TestCase, Verdict};
use crate::workload::{IntegrityWorkload, Variant, WorkloadSpec};

/// Runs an [`IntegrityWorkload`] inside private scratch directories.
#[derive(Debug)]
pub struct FileIntegrityCase {
    name: &'static str,
    variant: Variant,
    spec: WorkloadSpec,
    scratch_root: PathBuf,
    dirs: Option<(TempDir, TempDir)>,
    cancel: Option<CancellationToken>,
}

impl FileIntegrityCase {
    fn new(name: &'static str, variant: Variant, spec: WorkloadSpec, scratch_root: &Path) -> Self {
        Self {
            name,
            variant,
            spec,
            scratch_root: scratch_root.to_path_buf(),
            dirs: None,
            cancel: None,
        }
    }

    /// Put every file, get it back, compare content.
    pub fn put_get(spec: WorkloadSpec, scratch_root: &Path) -> Self {
        Self::new("FilePutGetTest", Variant::PutGet, spec, scratch_root)
    }

    /// Put every file, then delete it.
    pub fn put_delete(spec: WorkloadSpec, scratch_root: &Path) -> Self {
        Self::new("FilePutDeleteTest", Variant::PutDelete, spec, scratch_root)
    }

    /// Make the worker join abortable.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[async_trait]
impl TestCase for FileIntegrityCase {
    fn name(&self) -> &str {
        self.name
    }

    async fn prepare(&mut self, _env: &dyn Environment) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_root).await?;
        let input = tempfile::Builder::new().prefix("in-").tempdir_in(&self.scratch_root)?;
        let output = tempfile::Builder::new().prefix("out-").tempdir_in(&self.scratch_root)?;
        self.dirs = Some((input, output));
        Ok(())
    }

    async fn test(&mut self, env: &dyn Environment, verdict: &mut Verdict) -> Result<()> {
        let Some((input, output)) = &self.dirs else {
            return Ok(());
        };
        let mut spec = self.spec.clone();
        spec.workers *= env.worker_groups().max(1);
        tracing::info!(
            "{}: file_count {}, workers {}, min_size {}, max_size {}",
            self.name,
            spec.file_count,
            spec.workers,
            spec.min_size,
            spec.max_size
        );

        let mut workload = IntegrityWorkload::new(spec, self.variant, input.path(), output.path());
        if let Some(token) = &self.cancel {
            workload = workload.with_cancellation(token.clone());
        }

        env.query_status().await;
        let outcome = workload.execute(|worker| env.store(worker)).await?;
        env.query_status().await;

        for worker in outcome.workers.outcomes() {
            if let Some(failure) = worker.failure() {
                tracing::error!("{} {}", worker.label, failure);
            }
        }
        if outcome.passed() {
            verdict.mark_passed();
        } else if let Some(report) = outcome.verification.as_ref().filter(|r| !r.is_intact()) {
            tracing::error!("broken files: {}", report.broken.join(", "));
        }
        Ok(())
    }

    async fn cleanup(&mut self, _env: &dyn Environment) -> Result<()> {
        if let Some((input, output)) = self.dirs.take() {
            input.close()?;
            output.close()?;
        }
        Ok(())
    }
}
