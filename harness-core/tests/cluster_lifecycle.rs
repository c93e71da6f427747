//! Full cluster lifecycles against the mock channel and the in-memory store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nkfs_harness_core::cases::FileIntegrityCase;
use nkfs_harness_core::client::{MemoryObjectStore, ObjectStore};
use nkfs_harness_core::env::{ClusterEnv, Environment};
use nkfs_harness_core::node::NodeSet;
use nkfs_harness_core::remote::{Credentials, MockChannel, RecordedCall};
use nkfs_harness_core::runner;
use nkfs_harness_core::suite::TestSuite;
use nkfs_harness_core::workload::WorkloadSpec;
use nkfs_harness_core::{HarnessConfig, HarnessError, Result};
use tokio_util::sync::CancellationToken;

const NODES: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

/// Cluster lifecycle over the mock channel, data plane served from memory.
struct MemoryBackedCluster {
    inner: ClusterEnv,
    store: MemoryObjectStore,
}

#[async_trait]
impl Environment for MemoryBackedCluster {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn prepare(&mut self) -> Result<()> {
        self.inner.prepare().await
    }

    async fn cleanup(&mut self) {
        self.inner.cleanup().await
    }

    fn store(&self, _worker: usize) -> Arc<dyn ObjectStore> {
        Arc::new(self.store.clone())
    }

    fn worker_groups(&self) -> usize {
        self.inner.worker_groups()
    }

    async fn query_status(&self) {
        self.inner.query_status().await
    }
}

fn config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.cluster.settle_secs = 0;
    config
}

fn cluster(channel: &MockChannel, artifacts: &Path, config: &HarnessConfig) -> ClusterEnv {
    let addresses: Vec<String> = NODES.iter().map(|s| s.to_string()).collect();
    let nodes = NodeSet::from_addresses(
        &addresses,
        "root",
        &Credentials::Password("secret".into()),
        &["/dev/sdb".to_string()],
        artifacts,
        Arc::new(channel.clone()),
        &config.service,
    )
    .expect("unique addresses");
    ClusterEnv::new(nodes, config).expect("non-empty node set")
}

fn integrity_suite(spec: WorkloadSpec, scratch: &Path) -> TestSuite {
    let mut suite = TestSuite::new();
    suite.add(FileIntegrityCase::put_get(spec.clone(), scratch));
    suite.add(FileIntegrityCase::put_delete(spec, scratch));
    suite
}

#[tokio::test]
async fn three_nodes_pass_both_cases() {
    let artifacts = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    channel.respond("nproc", &["2"]);
    let config = config();

    let mut env = MemoryBackedCluster {
        inner: cluster(&channel, artifacts.path(), &config),
        store: MemoryObjectStore::new(),
    };
    let spec = WorkloadSpec {
        workers: 3,
        file_count: 10,
        min_size: 10,
        max_size: 100_000,
    };
    let mut suite = integrity_suite(spec, scratch.path());

    let summary = runner::run(&mut env, &mut suite).await;

    assert!(summary.success(), "setup error: {:?}", summary.setup_error);
    assert_eq!(summary.counts(), (2, 2));
    // 3 workers per node on 3 nodes, 10 files each: put+get keeps its 90
    // objects, put+delete removes its own 90
    assert_eq!(env.store.len(), 90);

    assert_eq!(channel.count("git clone"), 3);
    assert_eq!(channel.count("make -j 2"), 3);
    assert_eq!(channel.count("srv_start -b 0.0.0.0"), 3);
    assert_eq!(channel.count("neigh_add"), 3);
    assert_eq!(channel.count("rmmod"), 6);
    for address in NODES {
        let node_dir = artifacts.path().join(format!("node_{}", address));
        assert!(node_dir.join("nkfs.log").exists(), "missing log for {}", address);
        assert!(node_dir.join("dmesg.out").exists());
        assert_eq!(
            channel.count(&format!("srv_start -b 0.0.0.0 -e {} -p 9111", address)),
            1
        );
    }
}

#[tokio::test]
async fn workers_stage_files_through_their_own_node() {
    let artifacts = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    channel.respond("nkfs_client put", &["obj-1"]);
    let config = config();

    let mut env = cluster(&channel, artifacts.path(), &config);
    let spec = WorkloadSpec {
        workers: 1,
        file_count: 2,
        min_size: 16,
        max_size: 64,
    };
    let mut suite = TestSuite::new();
    suite.add(FileIntegrityCase::put_get(spec, scratch.path()));

    let summary = runner::run(&mut env, &mut suite).await;

    assert!(summary.setup_error.is_none());
    // Downloads from the mock are placeholders, so verification flags every file.
    assert_eq!(summary.counts(), (0, 1));

    let calls = channel.calls();
    for (worker, address) in NODES.iter().enumerate() {
        let worker_dir = format!("worker-{}", worker);

        let uploads: Vec<_> = calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Upload { host, local, remote } if host.as_str() == *address => {
                    Some((local.clone(), remote.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(uploads.len(), 2, "uploads to {}", address);
        for (local, remote) in &uploads {
            assert!(local.starts_with(scratch.path()));
            assert!(local.parent().unwrap().ends_with(&worker_dir));
            assert!(remote.starts_with("/root/sshexec/put-"));
        }

        let data_downloads: Vec<_> = calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Download { host, remote, local }
                    if host.as_str() == *address && remote.contains("/get-") =>
                {
                    Some(local.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(data_downloads.len(), 2, "downloads from {}", address);
        for local in &data_downloads {
            assert!(local.starts_with(scratch.path()));
            assert!(local.parent().unwrap().ends_with(&worker_dir));
        }

        let commands = channel.commands_on(address);
        let puts = format!("nkfs_client put -s {} -p 9111 -f /root/sshexec/put-", address);
        let gets = format!("nkfs_client get -s {} -p 9111 -f /root/sshexec/get-", address);
        assert_eq!(commands.iter().filter(|c| c.contains(&puts)).count(), 2);
        assert_eq!(commands.iter().filter(|c| c.contains(&gets)).count(), 2);
        assert_eq!(
            commands.iter().filter(|c| c.starts_with("rm -f /root/sshexec/")).count(),
            4
        );
    }
}

#[tokio::test]
async fn failed_start_aborts_setup_but_tears_down_every_node() {
    let artifacts = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    channel.fail_on_host("10.0.0.2", "srv_start", 1);
    let config = config();

    let mut env = cluster(&channel, artifacts.path(), &config);
    let mut suite = integrity_suite(WorkloadSpec::default(), scratch.path());

    let summary = runner::run(&mut env, &mut suite).await;

    assert!(!summary.success());
    assert!(summary.report.is_none());
    match summary.setup_error {
        Some(HarnessError::Aggregate {
            ref phase,
            failed,
            total,
            ref labels,
        }) => {
            assert_eq!(phase, "start");
            assert_eq!((failed, total), (1, 3));
            assert_eq!(labels, &vec!["10.0.0.2".to_string()]);
        }
        ref other => panic!("expected aggregate start failure, got {other:?}"),
    }

    // No mesh or workload after a setup failure.
    assert_eq!(channel.count("neigh_add"), 0);
    assert_eq!(channel.count("nkfs_client"), 0);
    // Every node whose start was attempted is stopped and has its logs collected.
    for address in NODES {
        let commands = channel.commands_on(address);
        assert!(commands.iter().any(|c| c == "sudo rmmod nkfs"), "{} not stopped", address);
        assert!(commands.iter().any(|c| c.contains("klog_sync")));
    }
}

#[tokio::test]
async fn failed_provision_skips_stop() {
    let artifacts = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    channel.fail_on_host("10.0.0.3", "git clone", 128);
    let config = config();

    let mut env = cluster(&channel, artifacts.path(), &config);
    let summary = runner::run(&mut env, &mut TestSuite::new()).await;

    assert!(matches!(
        summary.setup_error,
        Some(HarnessError::Aggregate { ref phase, failed: 1, .. }) if phase == "provision"
    ));
    // The other nodes still finished provisioning.
    assert_eq!(channel.count("make -j"), 2);
    assert_eq!(channel.count("insmod"), 0);
    assert_eq!(channel.count("rmmod"), 0);
    assert_eq!(channel.count("klog_sync"), 3);
}

#[tokio::test]
async fn log_collection_failure_does_not_block_stop() {
    let artifacts = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    channel.fail_downloads("10.0.0.1");
    channel.fail_on_host("10.0.0.2", "dmesg", 1);
    let config = config();

    let mut env = cluster(&channel, artifacts.path(), &config);
    let summary = runner::run(&mut env, &mut TestSuite::new()).await;

    assert!(summary.success());
    assert_eq!(channel.count("rmmod"), 6);
    assert!(artifacts.path().join("node_10.0.0.3/nkfs.log").exists());
}

#[tokio::test]
async fn zero_files_pass_trivially() {
    let artifacts = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    let config = config();

    let mut env = MemoryBackedCluster {
        inner: cluster(&channel, artifacts.path(), &config),
        store: MemoryObjectStore::new(),
    };
    let spec = WorkloadSpec {
        file_count: 0,
        ..WorkloadSpec::default()
    };
    let mut suite = integrity_suite(spec, scratch.path());

    let summary = runner::run(&mut env, &mut suite).await;
    assert!(summary.success());
    assert_eq!(summary.counts(), (2, 2));
    assert!(env.store.is_empty());
}

#[tokio::test]
async fn settle_wait_is_cancellable() {
    let artifacts = tempfile::tempdir().unwrap();
    let channel = MockChannel::new();
    let mut config = config();
    config.cluster.settle_secs = 3600;

    let token = CancellationToken::new();
    let mut env = cluster(&channel, artifacts.path(), &config).with_cancellation(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let err = env.prepare().await.unwrap_err();
    assert!(matches!(err, HarnessError::Cancelled { ref phase } if phase == "settle"));
    // Teardown still runs after cancellation.
    env.cleanup().await;
    assert_eq!(channel.count("rmmod"), 6);
}

#[test]
fn duplicate_addresses_are_rejected() {
    let addresses = vec!["10.0.0.1".to_string(), "10.0.0.1".to_string()];
    let err = NodeSet::from_addresses(
        &addresses,
        "root",
        &Credentials::Agent,
        &[],
        Path::new("/tmp"),
        Arc::new(MockChannel::new()),
        &HarnessConfig::default().service,
    )
    .unwrap_err();
    assert!(matches!(err, HarnessError::InvalidConfig(_)));
}
