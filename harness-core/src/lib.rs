//! # nkfs-harness-core
//!
//! Orchestration engine for nkfs integration tests.
//!
//! This crate provisions a set of machines (remote over SSH, or the local host over
//! loopback), deploys and starts the nkfs service on each, wires the nodes into a
//! full mesh, drives concurrent data-integrity workloads against the cluster, collects
//! diagnostics and tears everything down. Teardown continues through partial failures
//! so that one broken node does not abort the whole run.
//!
//! ## Layers
//!
//! - [`remote`]: command execution and file transfer on a host (ssh, local shell, mock)
//! - [`client`]: nkfs control-plane and data-plane commands built on a channel
//! - [`node`]: one machine under test and its lifecycle operations
//! - [`executor`]: parallel task group with aggregated failure reporting
//! - [`mesh`]: full-mesh neighbor registration
//! - [`workload`]: put/get/delete integrity workload and verification
//! - [`suite`]: test case state machine and sequential suite runner
//! - [`env`]: shared fixtures (local loopback, cluster)
//! - [`runner`]: prepare → suite → cleanup driver

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cases;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod mesh;
pub mod node;
pub mod remote;
pub mod runner;
pub mod suite;
pub mod workload;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
