//! Cluster-wide orchestration.
//!
//! [`Cluster`] owns the set of member [`Node`]s for one invocation and
//! exposes the topology-changing operations on top of them:
//!
//! - `health`: consistency fingerprinting, health check, convergence wait, status report
//! - `reshard`: balancing, node add/remove, slot filling, teardown
//! - `fix`: recovery of slots left MIGRATING/IMPORTING
//! - `create`: bootstrap of a brand-new cluster from bare instances
//! - `retry`: the bounded timeout-retry wrapper
//!
//! Nodes never point back at the cluster; operations that need the member
//! list receive it as a slice.

pub mod create;
pub mod fix;
pub mod health;
pub mod reshard;
pub mod retry;

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::client::{Connector, Node, NodeAddr, NodeInfo, Redirect};
use crate::error::{Error, Result};
use crate::slots::{MigrationOptions, SlotMigrationReport, TOTAL_SLOTS};

pub use create::{ClusterCreator, MasterCandidate, spread};
pub use health::{ClusterStatus, NodeStatus, fingerprint};
pub use retry::{RetryPolicy, with_retry};

/// Polling bounds for [`Cluster::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Pause between consistency polls.
    pub poll_interval: Duration,
    /// Polls before giving up.
    pub max_polls: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 10,
        }
    }
}

/// Tunables shared by every cluster operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Size of the hash slot space.
    pub total_slots: u16,
    /// Keys moved per GETKEYSINSLOT/MIGRATE batch.
    pub key_migration_count: usize,
    /// MIGRATE timeout in milliseconds.
    pub migrate_timeout_ms: u64,
    /// Retry policy for reshard and remove.
    pub retry: RetryPolicy,
    /// Convergence wait bounds.
    pub wait: WaitPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            total_slots: TOTAL_SLOTS,
            key_migration_count: 1,
            migrate_timeout_ms: 15000,
            retry: RetryPolicy::default(),
            wait: WaitPolicy::default(),
        }
    }
}

impl ClusterConfig {
    /// Set the size of the slot space.
    pub fn with_total_slots(mut self, total_slots: u16) -> Self {
        self.total_slots = total_slots;
        self
    }

    /// Set the migration batch size.
    pub fn with_key_migration_count(mut self, count: usize) -> Self {
        self.key_migration_count = count;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the convergence wait bounds.
    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Options handed to the slot migration engine.
    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            batch: self.key_migration_count,
            timeout_ms: self.migrate_timeout_ms,
        }
    }
}

/// A tolerated failure recorded while an operation ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// A key transfer was answered with ASK or MOVED.
    Redirected(Redirect),
    /// A transport timeout that was retried.
    TimedOut {
        /// Operation that was retried.
        operation: String,
        /// Error text.
        message: String,
    },
}

impl Attempt {
    /// Grouping key for summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Attempt::Redirected(Redirect::Ask { .. }) => "ask",
            Attempt::Redirected(Redirect::Moved { .. }) => "moved",
            Attempt::TimedOut { .. } => "timeout",
        }
    }
}

/// The member set of one cluster and the operations over it.
pub struct Cluster<C: Connector> {
    connector: C,
    nodes: Vec<Node<C::Transport>>,
    config: ClusterConfig,
    attempts: Vec<Attempt>,
}

impl<C: Connector> Cluster<C> {
    /// Build a cluster from already connected members.
    pub fn new(connector: C, nodes: Vec<Node<C::Transport>>, config: ClusterConfig) -> Self {
        Self {
            connector,
            nodes,
            config,
            attempts: Vec::new(),
        }
    }

    /// Discover the cluster from one member's view.
    ///
    /// `seed` stays first; every other member whose link is up and whose
    /// address is known is connected through `connector`.
    #[instrument(skip(connector, seed, config), fields(seed = %seed))]
    pub async fn from_node(
        connector: C,
        seed: Node<C::Transport>,
        config: ClusterConfig,
    ) -> Result<Self> {
        let topology = seed.nodes().await?;
        let mut nodes = vec![seed];

        for member in topology.nodes.iter().filter(|n| !n.is_myself()) {
            if !member.is_connected() || member.flags.noaddr || member.flags.handshake {
                debug!(node = %member.name, "Skipping unreachable member");
                continue;
            }
            let addr = NodeAddr::parse(&member.addr)?;
            nodes.push(connector.connect(&addr).await?);
        }

        info!(nodes = nodes.len(), "Discovered cluster");
        Ok(Self::new(connector, nodes, config))
    }

    /// Member nodes, in discovery order.
    pub fn nodes(&self) -> &[Node<C::Transport>] {
        &self.nodes
    }

    /// Active configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Tolerated failures recorded so far.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Attempts grouped by kind.
    pub fn attempt_summary(&self) -> BTreeMap<&'static str, usize> {
        let mut summary = BTreeMap::new();
        for attempt in &self.attempts {
            *summary.entry(attempt.kind()).or_insert(0) += 1;
        }
        summary
    }

    /// Log the attempt summary.
    pub fn log_attempts(&self) {
        info!(total = self.attempts.len(), "Attempts");
        for (kind, count) in self.attempt_summary() {
            info!(kind, count, "Attempt group");
        }
    }

    /// Fold per-slot redirections into the attempts log.
    fn absorb(&mut self, reports: &[SlotMigrationReport]) {
        self.attempts.extend(
            reports
                .iter()
                .flat_map(|r| r.attempts.iter().cloned().map(Attempt::Redirected)),
        );
    }

    fn node(&self, idx: usize) -> Result<&Node<C::Transport>> {
        self.nodes
            .get(idx)
            .ok_or_else(|| Error::InvariantViolation(format!("no member at index {}", idx)))
    }

    /// Every member that reports itself as a master, with its own record.
    pub async fn masters(&self) -> Result<Vec<(usize, NodeInfo)>> {
        let mut masters = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            let info = node.node_info().await?;
            if info.is_master() {
                masters.push((idx, info));
            }
        }
        Ok(masters)
    }

    /// Find a member by node id.
    pub async fn get_node(&self, node_id: &str) -> Result<Option<&Node<C::Transport>>> {
        for node in &self.nodes {
            if node.name().await? == node_id {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}
