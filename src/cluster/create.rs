//! Bootstrap of a new cluster from bare instances.
//!
//! The sequence is `check → initialize_slots → set_slots → join_cluster →
//! assign_config_epoch → wait`. Candidates not chosen as masters are attached
//! as replicas once the masters have converged.

use std::collections::VecDeque;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::{Cluster, ClusterConfig};
use crate::client::{Connector, Node, NodeAddr};
use crate::error::{Error, Result};
use crate::slots::{SlotRange, split_slots};

/// Pick `n` indices, round-robin across hosts in first-seen order.
///
/// ```
/// use valkey_clu::cluster::spread;
///
/// let hosts = ["a", "a", "b", "b", "c", "c"];
/// assert_eq!(spread(&hosts, 3), vec![0, 2, 4]);
/// assert_eq!(spread(&hosts, 4), vec![0, 2, 4, 1]);
/// ```
pub fn spread<S: AsRef<str>>(hosts: &[S], n: usize) -> Vec<usize> {
    let mut groups: Vec<(&str, VecDeque<usize>)> = Vec::new();
    for (idx, host) in hosts.iter().enumerate() {
        let host = host.as_ref();
        match groups.iter_mut().find(|(h, _)| *h == host) {
            Some((_, group)) => group.push_back(idx),
            None => groups.push((host, VecDeque::from([idx]))),
        }
    }

    let mut picked = Vec::with_capacity(n.min(hosts.len()));
    while picked.len() < n && groups.iter().any(|(_, g)| !g.is_empty()) {
        for (_, group) in groups.iter_mut() {
            if picked.len() >= n {
                break;
            }
            if let Some(idx) = group.pop_front() {
                picked.push(idx);
            }
        }
    }
    picked
}

/// A bare instance and the slot ranges it will claim.
#[derive(Debug)]
pub struct MasterCandidate<T> {
    /// The instance.
    pub node: Node<T>,
    /// Ranges to claim with ADDSLOTS.
    pub unassigned_slots: Vec<SlotRange>,
}

impl<T: crate::client::Transport> MasterCandidate<T> {
    /// Wrap a connected instance.
    pub fn new(node: Node<T>) -> Self {
        Self {
            node,
            unassigned_slots: Vec::new(),
        }
    }

    /// Check if this candidate was given any slots.
    pub fn is_enabled(&self) -> bool {
        !self.unassigned_slots.is_empty()
    }

    /// Claim the assigned ranges.
    pub async fn assign_slots(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::InvariantViolation(format!(
                "{} has no slots to claim",
                self.node
            )));
        }
        for range in &self.unassigned_slots {
            let slots: Vec<u16> = range.iter().collect();
            self.node.add_slots(&slots).await?;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let node = &self.node;
        let info = node.info(Some("cluster")).await?;
        if info.get("cluster_enabled").map(String::as_str) != Some("1") {
            return Err(Error::Precondition(format!(
                "{} is not running in cluster mode",
                node
            )));
        }

        node.select(0).await?;
        if node.random_key().await?.is_some() {
            return Err(Error::Precondition(format!("{} is not empty", node)));
        }

        let known = node.cluster_info().await?.known_nodes();
        if known != Some(1) {
            return Err(Error::Precondition(format!(
                "{} already knows {} nodes",
                node,
                known.unwrap_or(0)
            )));
        }
        Ok(())
    }
}

/// One-shot builder of a brand-new cluster.
pub struct ClusterCreator<C: Connector> {
    connector: C,
    config: ClusterConfig,
    candidates: Vec<MasterCandidate<C::Transport>>,
    masters: Vec<usize>,
    master_count: Option<usize>,
}

impl<C: Connector> ClusterCreator<C> {
    /// Use already connected instances.
    pub fn new(connector: C, nodes: Vec<Node<C::Transport>>, config: ClusterConfig) -> Self {
        Self {
            connector,
            config,
            candidates: nodes.into_iter().map(MasterCandidate::new).collect(),
            masters: Vec::new(),
            master_count: None,
        }
    }

    /// Connect to every address in `uris`.
    pub async fn connect<S: AsRef<str>>(
        connector: C,
        uris: &[S],
        config: ClusterConfig,
    ) -> Result<Self> {
        let mut nodes = Vec::with_capacity(uris.len());
        for uri in uris {
            let addr = NodeAddr::parse(uri.as_ref())?;
            nodes.push(connector.connect(&addr).await?);
        }
        Ok(Self::new(connector, nodes, config))
    }

    /// Choose only `count` masters; the rest become replicas.
    pub fn with_master_count(mut self, count: usize) -> Self {
        self.master_count = Some(count);
        self
    }

    /// Candidate instances.
    pub fn candidates(&self) -> &[MasterCandidate<C::Transport>] {
        &self.candidates
    }

    /// Refuse to proceed unless every candidate is a bare, empty,
    /// cluster-enabled instance and there are at least two of them.
    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<()> {
        if self.candidates.len() < 2 {
            return Err(Error::Precondition(format!(
                "at least 2 instances are needed, got {}",
                self.candidates.len()
            )));
        }

        let probes = join_all(self.candidates.iter().map(MasterCandidate::probe)).await;
        probes.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Pick masters across hosts and hand each a contiguous slot range.
    pub fn initialize_slots(&mut self) {
        let hosts: Vec<&str> = self.candidates.iter().map(|c| c.node.host()).collect();
        let count = self
            .master_count
            .unwrap_or(hosts.len())
            .clamp(1, hosts.len().max(1));
        let picked = spread(&hosts, count);

        for candidate in &mut self.candidates {
            candidate.unassigned_slots.clear();
        }
        for (&idx, range) in picked.iter().zip(split_slots(self.config.total_slots, picked.len())) {
            if let Some(candidate) = self.candidates.get_mut(idx) {
                candidate.unassigned_slots.push(range);
            }
        }

        self.masters = picked
            .into_iter()
            .filter(|&idx| self.candidates.get(idx).is_some_and(MasterCandidate::is_enabled))
            .collect();
    }

    /// Masters in selection order with the ranges they will claim.
    pub fn plan(&self) -> Vec<(NodeAddr, Vec<SlotRange>)> {
        self.chosen()
            .map(|c| (c.node.addr(), c.unassigned_slots.clone()))
            .collect()
    }

    fn chosen(&self) -> impl Iterator<Item = &MasterCandidate<C::Transport>> {
        self.masters.iter().filter_map(|&idx| self.candidates.get(idx))
    }

    /// Every master claims its ranges.
    pub async fn set_slots(&self) -> Result<()> {
        for master in self.chosen() {
            master.assign_slots().await?;
        }
        Ok(())
    }

    /// Every master meets the first one.
    pub async fn join_cluster(&self) -> Result<()> {
        let mut chosen = self.chosen();
        let Some(first) = chosen.next() else {
            return Ok(());
        };
        for master in chosen {
            master.node.meet(first.node.host(), first.node.port()).await?;
        }
        Ok(())
    }

    /// Give masters config epochs 1, 2, ... in selection order.
    ///
    /// A node refusing its epoch is logged and skipped.
    pub async fn assign_config_epoch(&self) {
        for (epoch, master) in (1u64..).zip(self.chosen()) {
            if let Err(e) = master.node.set_config_epoch(epoch).await {
                warn!(node = %master.node, epoch, error = %e, "Config epoch not set");
            }
        }
    }

    /// Run the whole bootstrap and return the converged cluster.
    #[instrument(skip(self))]
    pub async fn create(mut self) -> Result<Cluster<C>> {
        self.check().await?;
        self.initialize_slots();
        for (addr, ranges) in self.plan() {
            let ranges: Vec<String> = ranges.iter().map(ToString::to_string).collect();
            info!(master = %addr, slots = %ranges.join(","), "Planned master");
        }

        self.set_slots().await?;
        self.join_cluster().await?;
        self.assign_config_epoch().await;

        let mut slots: Vec<Option<MasterCandidate<C::Transport>>> =
            self.candidates.into_iter().map(Some).collect();
        let masters: Vec<Node<C::Transport>> = self
            .masters
            .iter()
            .filter_map(|&idx| slots.get_mut(idx).and_then(Option::take))
            .map(|c| c.node)
            .collect();
        let replicas: Vec<Node<C::Transport>> = slots.into_iter().flatten().map(|c| c.node).collect();

        let mut cluster = Cluster::new(self.connector, masters, self.config);
        cluster.wait().await?;
        info!(masters = cluster.nodes.len(), "Masters converged");

        if !replicas.is_empty() {
            attach_replicas(&mut cluster, replicas).await?;
        }
        Ok(cluster)
    }
}

/// Introduce `replicas` to the cluster and spread them over the masters.
async fn attach_replicas<C: Connector>(
    cluster: &mut Cluster<C>,
    replicas: Vec<Node<C::Transport>>,
) -> Result<()> {
    let mut master_ids = Vec::with_capacity(cluster.nodes.len());
    for node in &cluster.nodes {
        master_ids.push(node.name().await?);
    }

    let first = cluster
        .nodes
        .first()
        .ok_or_else(|| Error::Precondition("cluster has no master".to_string()))?;
    for replica in &replicas {
        replica.meet(first.host(), first.port()).await?;
    }
    let offset = cluster.nodes.len();
    cluster.nodes.extend(replicas);
    cluster.wait().await?;

    for (i, replica) in cluster.nodes.iter().skip(offset).enumerate() {
        if let Some(master_id) = master_ids.get(i % master_ids.len()) {
            debug!(replica = %replica, master = %master_id, "Attaching replica");
            replica.replicate(master_id).await?;
        }
    }
    info!(replicas = cluster.nodes.len() - offset, "Replicas attached");
    Ok(())
}
