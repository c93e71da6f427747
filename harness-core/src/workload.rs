//! Data-integrity workload.
//!
//! Each worker generates random files in its own input directory, pushes them
//! through the store and either deletes them again ([`Variant::PutDelete`]) or
//! fetches them into its own output directory ([`Variant::PutGet`]). Workers share
//! nothing but the store. After every worker has finished, put+get runs compare
//! SHA-256 fingerprints of each input file with its output; any mismatch or
//! missing output is reported by name.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::{Rng, RngCore};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::client::{ObjectId, ObjectStore};
use crate::error::{HarnessError, Result};
use crate::executor::{BatchReport, ParallelExecutor, Task};
use crate::remote::TransportError;

/// Read size for streaming hashes: 128 SHA-256 blocks.
pub const HASH_CHUNK: usize = 128 * 64;

const WRITE_CHUNK: usize = 64 * 1024;

/// Workload parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkloadSpec {
    /// Concurrent workers (default: 3).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Files generated per worker (default: 10).
    #[serde(default = "default_file_count")]
    pub file_count: usize,
    /// Smallest file size in bytes, inclusive (default: 10).
    #[serde(default = "default_min_size")]
    pub min_size: u64,
    /// Largest file size in bytes, inclusive (default: 10_000_000).
    #[serde(default = "default_max_size")]
    pub max_size: u64,
}

fn default_workers() -> usize {
    3
}

fn default_file_count() -> usize {
    10
}

fn default_min_size() -> u64 {
    10
}

fn default_max_size() -> u64 {
    10_000_000
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            file_count: default_file_count(),
            min_size: default_min_size(),
            max_size: default_max_size(),
        }
    }
}

impl WorkloadSpec {
    /// Reject zero workers and inverted size ranges.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(HarnessError::InvalidConfig("workload.workers must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(HarnessError::InvalidConfig(format!(
                "workload.min_size ({}) exceeds workload.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// What each worker does with the files it stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Fetch every file back, then verify content.
    PutGet,
    /// Delete every file right after storing all of them.
    PutDelete,
}

/// SHA-256 digest of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// A file written by [`generate_files`].
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    /// File name inside the worker's input directory.
    pub name: String,
    /// Content digest.
    pub fingerprint: Fingerprint,
    /// Size in bytes.
    pub size: u64,
}

/// A stored file: the id the store returned plus what was stored.
#[derive(Debug, Clone)]
pub struct WorkloadRecord {
    /// Identifier returned by `put`.
    pub object_id: ObjectId,
    /// File name inside the worker's directories.
    pub file_name: String,
    /// Digest of the stored content.
    pub fingerprint: Fingerprint,
    /// Size in bytes.
    pub size: u64,
}

impl WorkloadRecord {
    /// Delete the object. The record is consumed since its id is no longer valid.
    pub async fn delete(self, store: &dyn ObjectStore) -> std::result::Result<(), TransportError> {
        store.delete(&self.object_id).await
    }
}

/// Write `spec.file_count` random files into `dir`.
pub async fn generate_files(dir: &Path, spec: &WorkloadSpec) -> io::Result<Vec<GeneratedFile>> {
    let dir = dir.to_path_buf();
    let count = spec.file_count;
    let (min, max) = (spec.min_size, spec.max_size);
    tokio::task::spawn_blocking(move || {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| -> io::Result<GeneratedFile> {
                let name = Uuid::new_v4().simple().to_string();
                let size = rng.gen_range(min..=max);
                let fingerprint = write_random_file(&dir.join(&name), size, &mut rng)?;
                Ok(GeneratedFile {
                    name,
                    fingerprint,
                    size,
                })
            })
            .collect()
    })
    .await
    .map_err(io::Error::other)?
}

fn write_random_file(path: &Path, size: u64, rng: &mut impl RngCore) -> io::Result<Fingerprint> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; WRITE_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(WRITE_CHUNK as u64) as usize;
        rng.fill_bytes(&mut buf[..n]);
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    file.flush()?;
    Ok(Fingerprint(hasher.finalize().into()))
}

/// Streaming SHA-256 of a file, read in [`HASH_CHUNK`] pieces.
pub async fn fingerprint_file(path: &Path) -> io::Result<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint(hasher.finalize().into()))
}

/// Result of comparing an input tree with an output tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Number of input files compared.
    pub checked: usize,
    /// Relative paths of files whose output is missing or differs, sorted.
    pub broken: Vec<String>,
}

impl VerificationReport {
    /// True if every file survived.
    pub fn is_intact(&self) -> bool {
        self.broken.is_empty()
    }

    /// `Err(Verification)` listing the broken files, if any.
    pub fn ensure_intact(&self) -> Result<()> {
        if self.is_intact() {
            Ok(())
        } else {
            Err(HarnessError::Verification {
                broken: self.broken.clone(),
            })
        }
    }
}

/// Files under `root`, as sorted paths relative to it.
async fn relative_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .map_err(io::Error::other)?
                .to_path_buf();
            files.push(rel);
        }
        files.sort();
        Ok(files)
    })
    .await
    .map_err(io::Error::other)?
}

/// Compare every file under `input_root` with the same relative path under
/// `output_root`.
pub async fn verify(input_root: &Path, output_root: &Path) -> io::Result<VerificationReport> {
    let mut report = VerificationReport::default();
    for rel in relative_files(input_root).await? {
        report.checked += 1;
        let expected = fingerprint_file(&input_root.join(&rel)).await?;
        let name = rel.to_string_lossy().into_owned();
        match fingerprint_file(&output_root.join(&rel)).await {
            Ok(actual) if actual == expected => {}
            Ok(actual) => {
                tracing::error!("{}: fingerprint {} != {}", name, actual, expected);
                report.broken.push(name);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::error!("{}: missing from output", name);
                report.broken.push(name);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// What one worker did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Worker index.
    pub worker: usize,
    /// Files stored.
    pub files: usize,
    /// Bytes stored.
    pub bytes: u64,
}

/// Outcome of a workload run.
#[derive(Debug)]
pub struct WorkloadOutcome {
    /// Per-worker results.
    pub workers: BatchReport<WorkerSummary>,
    /// Content check, for put+get runs.
    pub verification: Option<VerificationReport>,
}

impl WorkloadOutcome {
    /// True if every worker succeeded and no file was broken.
    pub fn passed(&self) -> bool {
        self.workers.is_success()
            && self
                .verification
                .as_ref()
                .map_or(true, VerificationReport::is_intact)
    }
}

/// N concurrent workers pushing random content through a store.
#[derive(Debug, Clone)]
pub struct IntegrityWorkload {
    spec: WorkloadSpec,
    variant: Variant,
    input_root: PathBuf,
    output_root: PathBuf,
    cancel: Option<CancellationToken>,
}

impl IntegrityWorkload {
    /// Create a workload. Worker `i` uses `<root>/worker-<i>` for input and output.
    pub fn new(spec: WorkloadSpec, variant: Variant, input_root: &Path, output_root: &Path) -> Self {
        Self {
            spec,
            variant,
            input_root: input_root.to_path_buf(),
            output_root: output_root.to_path_buf(),
            cancel: None,
        }
    }

    /// Make the worker join abortable.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run every worker to completion, then verify (put+get only).
    ///
    /// `store_for(i)` supplies worker `i`'s store. Worker failures are part of the
    /// outcome; only local I/O errors during verification are returned as `Err`.
    pub async fn execute<F>(&self, store_for: F) -> Result<WorkloadOutcome>
    where
        F: Fn(usize) -> Arc<dyn ObjectStore>,
    {
        tracing::info!(
            "{:?}: {} worker(s) x {} file(s), sizes {}..={}",
            self.variant,
            self.spec.workers,
            self.spec.file_count,
            self.spec.min_size,
            self.spec.max_size
        );

        let tasks = (0..self.spec.workers)
            .map(|i| {
                let worker = Worker {
                    index: i,
                    spec: self.spec.clone(),
                    variant: self.variant,
                    input_dir: self.input_root.join(format!("worker-{}", i)),
                    output_dir: self.output_root.join(format!("worker-{}", i)),
                    store: store_for(i),
                };
                Task::new(format!("worker-{}", i), worker.run())
            })
            .collect();

        let mut executor = ParallelExecutor::new(format!("{:?}", self.variant));
        if let Some(token) = &self.cancel {
            executor = executor.with_cancellation(token.clone());
        }
        let workers = executor.join(tasks).await;

        let verification = match self.variant {
            Variant::PutGet => {
                let report = verify(&self.input_root, &self.output_root).await?;
                if report.is_intact() {
                    tracing::info!("all {} file(s) intact", report.checked);
                } else {
                    tracing::error!("broken files: {:?}", report.broken);
                }
                Some(report)
            }
            Variant::PutDelete => None,
        };

        Ok(WorkloadOutcome {
            workers,
            verification,
        })
    }
}

struct Worker {
    index: usize,
    spec: WorkloadSpec,
    variant: Variant,
    input_dir: PathBuf,
    output_dir: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl Worker {
    async fn run(self) -> Result<WorkerSummary> {
        let span = tracing::info_span!("worker", index = self.index);
        async move {
            tokio::fs::create_dir_all(&self.input_dir).await?;
            tokio::fs::create_dir_all(&self.output_dir).await?;

            let files = generate_files(&self.input_dir, &self.spec).await?;
            let mut records = Vec::with_capacity(files.len());
            for file in files {
                let object_id = self.store.put(&self.input_dir.join(&file.name)).await?;
                tracing::debug!("put {} ({} bytes) -> {}", file.name, file.size, object_id);
                records.push(WorkloadRecord {
                    object_id,
                    file_name: file.name,
                    fingerprint: file.fingerprint,
                    size: file.size,
                });
            }

            let summary = WorkerSummary {
                worker: self.index,
                files: records.len(),
                bytes: records.iter().map(|r| r.size).sum(),
            };

            match self.variant {
                Variant::PutGet => {
                    for record in &records {
                        self.store
                            .get(&record.object_id, &self.output_dir.join(&record.file_name))
                            .await?;
                        tracing::debug!("get {} -> {}", record.object_id, record.file_name);
                    }
                }
                Variant::PutDelete => {
                    for record in records {
                        record.delete(self.store.as_ref()).await?;
                    }
                }
            }
            Ok::<_, HarnessError>(summary)
        }
        .instrument(span)
        .await
    }
}
