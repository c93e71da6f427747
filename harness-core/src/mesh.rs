//! Full-mesh neighbor registration.
//!
//! Every unordered pair of nodes is registered once. The service adds the
//! initiating host to its own neighbor table when it accepts the handshake, so a
//! single `neigh_add` per pair leaves both ends aware of each other. Clusters
//! running a service build without that behavior can ask for
//! [`Registration::Bidirectional`].
//!
//! Registration is issued sequentially, pair by pair.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::error::{HarnessError, Result};
use crate::node::NodeSet;

/// Direction of neighbor registration calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Registration {
    /// One call per unordered pair, issued on the pair's first node.
    #[default]
    OneWay,
    /// Two calls per pair, one on each node.
    Bidirectional,
}

/// An unordered pair of distinct node addresses, stored as `(min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NeighborPair {
    first: String,
    second: String,
}

impl NeighborPair {
    /// Canonical pair of two addresses; `None` if they are equal.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        match a.cmp(b) {
            std::cmp::Ordering::Less => Some(Self {
                first: a.to_string(),
                second: b.to_string(),
            }),
            std::cmp::Ordering::Greater => Some(Self {
                first: b.to_string(),
                second: a.to_string(),
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Smaller address.
    pub fn first(&self) -> &str {
        &self.first
    }

    /// Larger address.
    pub fn second(&self) -> &str {
        &self.second
    }
}

/// All unordered pairs over `addresses`, independent of input order.
pub fn mesh_pairs<'a>(addresses: impl IntoIterator<Item = &'a str>) -> BTreeSet<NeighborPair> {
    let addresses: Vec<&str> = addresses.into_iter().collect();
    let mut pairs = BTreeSet::new();
    for (i, a) in addresses.iter().enumerate() {
        for b in &addresses[i + 1..] {
            if let Some(pair) = NeighborPair::new(a, b) {
                pairs.insert(pair);
            }
        }
    }
    pairs
}

/// Connects a node set into a full mesh.
#[derive(Debug, Clone)]
pub struct MeshTopologyBuilder {
    port: u16,
    registration: Registration,
}

impl MeshTopologyBuilder {
    /// Builder registering peers on `port`, one way per pair.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            registration: Registration::default(),
        }
    }

    /// Choose the registration direction.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = registration;
        self
    }

    /// Registration calls as `(node, peer)`, in issue order.
    pub fn plan(&self, nodes: &NodeSet) -> Vec<(String, String)> {
        let mut calls = Vec::new();
        for pair in mesh_pairs(nodes.addresses()) {
            calls.push((pair.first.clone(), pair.second.clone()));
            if self.registration == Registration::Bidirectional {
                calls.push((pair.second, pair.first));
            }
        }
        calls
    }

    /// Issue every registration call. Returns the number of calls made.
    ///
    /// The first failure aborts the phase with a registration error.
    pub async fn connect(&self, nodes: &NodeSet) -> Result<usize> {
        let plan = self.plan(nodes);
        tracing::info!(
            "connecting {} nodes with {} registration call(s) ({:?})",
            nodes.len(),
            plan.len(),
            self.registration
        );
        for (node, peer) in &plan {
            let node = nodes.get(node).ok_or_else(|| {
                HarnessError::InvalidConfig(format!("mesh plan names unknown node {}", node))
            })?;
            node.add_neighbor(peer, self.port).await?;
        }
        Ok(plan.len())
    }
}
