//! Consistency, health and status.
//!
//! Every master is asked for its own `CLUSTER NODES` view. A view is reduced
//! to a fingerprint (SHA-256 of sorted node ids and sorted slots); the cluster
//! is consistent when all masters produce the same fingerprint, i.e. gossip
//! has converged. Health additionally requires full slot coverage.

use std::collections::BTreeSet;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use super::Cluster;
use crate::client::{Connector, Topology};
use crate::error::{Error, Result};

/// Hex SHA-256 of a view's canonical signature.
pub fn fingerprint(topology: &Topology) -> String {
    hex::encode(Sha256::digest(topology.signature().as_bytes()))
}

/// Per-node entry of a [`ClusterStatus`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node id.
    pub id: String,
    /// `host:port` as seen by the cluster.
    pub addr: String,
    /// `master` or `slave`.
    pub role: String,
    /// Master id for replicas.
    pub replicates: Option<String>,
    /// Number of owned slots.
    pub slots: usize,
    /// Owned slots as ranges, e.g. `0-5460,5462`.
    pub ranges: String,
    /// Slots this node is migrating away.
    pub migrating: Vec<u16>,
    /// Slots this node is importing.
    pub importing: Vec<u16>,
}

/// Snapshot of a cluster for display.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClusterStatus {
    /// All masters agree on the topology.
    pub consistent: bool,
    /// Consistent with every slot assigned.
    pub healthy: bool,
    /// Size of the slot space.
    pub total_slots: u16,
    /// Slots owned by some master.
    pub assigned_slots: usize,
    /// One entry per member.
    pub nodes: Vec<NodeStatus>,
}

impl ClusterStatus {
    /// Check if any member has a slot left MIGRATING or IMPORTING.
    pub fn has_open_slots(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| !n.migrating.is_empty() || !n.importing.is_empty())
    }
}

impl<C: Connector> Cluster<C> {
    /// Views of every member that reports itself as a master.
    async fn master_views(&self) -> Result<Vec<Topology>> {
        let mut views = Vec::new();
        for node in &self.nodes {
            let view = node.nodes().await?;
            if view.myself().is_some_and(|me| me.is_master()) {
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Check whether every master reports the same membership and slot map.
    #[instrument(skip(self), level = "debug")]
    pub async fn consistent(&self) -> Result<bool> {
        let fingerprints: BTreeSet<String> = self
            .master_views()
            .await?
            .iter()
            .map(fingerprint)
            .collect();
        debug!(distinct = fingerprints.len(), "Master fingerprints");
        Ok(fingerprints.len() == 1)
    }

    /// Slots owned by masters, each according to its own record.
    async fn assigned_slots(&self) -> Result<BTreeSet<u16>> {
        Ok(self
            .masters()
            .await?
            .into_iter()
            .flat_map(|(_, info)| info.slots)
            .collect())
    }

    /// Consistent and every slot owned.
    pub async fn healthy(&self) -> Result<bool> {
        if !self.consistent().await? {
            return Ok(false);
        }
        let assigned = self.assigned_slots().await?;
        Ok(assigned.len() == usize::from(self.config.total_slots))
    }

    /// Poll until consistent, then require health.
    ///
    /// Fails with [`Error::NotConsistent`] after `wait.max_polls` polls and
    /// with [`Error::NotHealthy`] if the converged cluster has gaps.
    #[instrument(skip(self))]
    pub async fn wait(&self) -> Result<()> {
        let policy = &self.config.wait;
        let mut polls = 0;

        while !self.consistent().await? {
            if polls >= policy.max_polls {
                return Err(Error::NotConsistent);
            }
            polls += 1;
            debug!(polls, "Waiting for the cluster to converge");
            tokio::time::sleep(policy.poll_interval).await;
        }

        if !self.healthy().await? {
            return Err(Error::NotHealthy);
        }

        info!(polls, "Cluster converged");
        Ok(())
    }

    /// Build a status report from every member's own record.
    pub async fn status(&self) -> Result<ClusterStatus> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut assigned = BTreeSet::new();

        for node in &self.nodes {
            let info = node.node_info().await?;
            if info.is_master() {
                assigned.extend(info.slots.iter().copied());
            }
            nodes.push(NodeStatus {
                id: info.name.clone(),
                addr: node.addr().to_string(),
                role: info.flags.role().to_string(),
                replicates: info.replicate.clone(),
                slots: info.slots.len(),
                ranges: info
                    .slot_ranges()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                migrating: info.migrating.keys().copied().collect(),
                importing: info.importing.keys().copied().collect(),
            });
        }

        let consistent = self.consistent().await?;
        Ok(ClusterStatus {
            consistent,
            healthy: consistent && assigned.len() == usize::from(self.config.total_slots),
            total_slots: self.config.total_slots,
            assigned_slots: assigned.len(),
            nodes,
        })
    }
}
