//! Slot rebalancing and membership changes.

use std::collections::BTreeSet;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::{Cluster, with_retry};
use crate::client::{Connector, Node, NodeAddr, SlotAction};
use crate::error::{Error, Result};
use crate::slots::{MasterLoad, SlotMigrationReport, divide, migrate_slot, missing_slots, slot_balance};

/// Where unowned slots go: `(member index, node id, slots)`.
type FillPlan = Vec<(usize, String, Vec<u16>)>;

impl<C: Connector> Cluster<C> {
    /// Level slot ownership across masters.
    ///
    /// Does nothing unless the cluster is consistent. Retried on timeouts.
    pub async fn reshard(&mut self) -> Result<Vec<SlotMigrationReport>> {
        let policy = self.config.retry.clone();
        let mut log = Vec::new();
        let result = with_retry(&policy, "reshard", &mut log, || self.reshard_once()).await;
        self.attempts.extend(log);

        let reports = result?;
        self.absorb(&reports);
        Ok(reports)
    }

    #[instrument(skip(self))]
    async fn reshard_once(&self) -> Result<Vec<SlotMigrationReport>> {
        if !self.consistent().await? {
            warn!("Cluster not consistent, skipping reshard");
            return Ok(Vec::new());
        }

        let loads = self
            .masters()
            .await?
            .into_iter()
            .map(|(idx, info)| MasterLoad::new(idx, info.slots.len()))
            .collect();
        let plan = slot_balance(loads, usize::from(self.config.total_slots));
        info!(slots = plan.slots_to_move(), "Rebalance planned");

        let mut reports = Vec::new();
        for instruction in plan.instructions() {
            let src = self.node(instruction.source)?;
            let dst = self.node(instruction.destination)?;
            reports.extend(self.migrate(src, dst, instruction.count).await?);
        }

        info!(slots = reports.len(), "Rebalance complete");
        Ok(reports)
    }

    /// Move the `count` least populated slots of `src` to `dst`.
    ///
    /// `count` is clamped to what `src` owns. Slots with equal key counts keep
    /// their slot order.
    #[instrument(skip(self, src, dst), fields(source = %src, destination = %dst))]
    pub async fn migrate(
        &self,
        src: &Node<C::Transport>,
        dst: &Node<C::Transport>,
        count: usize,
    ) -> Result<Vec<SlotMigrationReport>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let slots = src.slots().await?;
        let count = count.min(slots.len());

        let mut ranked = Vec::with_capacity(slots.len());
        for slot in slots {
            ranked.push((slot, src.count_keys_in_slot(slot).await?));
        }
        ranked.sort_by_key(|(_, keys)| *keys);

        let options = self.config.migration_options();
        let mut reports = Vec::with_capacity(count);
        for (slot, _) in ranked.into_iter().take(count) {
            reports.push(migrate_slot(src, dst, slot, &self.nodes, &options).await?);
        }
        Ok(reports)
    }

    /// Evacuate every slot of `src` across the other masters.
    ///
    /// Shares come from `divide` and go to the least loaded masters first.
    #[instrument(skip(self, src), fields(node = %src))]
    pub async fn migrate_node(&self, src: &Node<C::Transport>) -> Result<Vec<SlotMigrationReport>> {
        let src_info = src.node_info().await?;
        let slot_count = src_info.slots.len();
        if slot_count == 0 {
            return Ok(Vec::new());
        }

        let mut others: Vec<_> = self
            .masters()
            .await?
            .into_iter()
            .filter(|(_, info)| info.name != src_info.name)
            .collect();
        if others.is_empty() {
            return Err(Error::Precondition(format!(
                "no other master can take the {} slots of {}",
                slot_count, src
            )));
        }
        others.sort_by_key(|(_, info)| info.slots.len());

        let mut reports = Vec::new();
        for ((idx, _), count) in others.iter().zip(divide(slot_count, others.len())) {
            reports.extend(self.migrate(src, self.node(*idx)?, count).await?);
        }
        Ok(reports)
    }

    /// Connect to `uri`, introduce it to the cluster and wait for convergence.
    #[instrument(skip(self))]
    pub async fn add_node(&mut self, uri: &str) -> Result<()> {
        let addr = NodeAddr::parse(uri)?;
        let node = self.connector.connect(&addr).await?;
        let member = self
            .nodes
            .first()
            .ok_or_else(|| Error::Precondition("cluster has no members".to_string()))?;

        node.meet(member.host(), member.port()).await?;
        info!(node = %node, "Node joined");
        self.nodes.push(node);
        self.wait().await
    }

    /// Add several nodes one after the other.
    ///
    /// Slots are not moved; run [`Cluster::reshard`] afterwards.
    pub async fn add_nodes<S: AsRef<str>>(&mut self, uris: &[S]) -> Result<()> {
        for uri in uris {
            self.add_node(uri.as_ref()).await?;
        }
        Ok(())
    }

    /// Remove `node` from the cluster.
    ///
    /// A master is emptied first. Its replicas move to the master with the
    /// fewest replicas, every remaining member forgets it, and it is reset.
    /// Retried on timeouts.
    pub async fn remove_node(&mut self, node: &Node<C::Transport>) -> Result<()> {
        let policy = self.config.retry.clone();
        let mut log = Vec::new();
        let result =
            with_retry(&policy, "remove_node", &mut log, || self.remove_node_once(node)).await;
        self.attempts.extend(log);

        let (dropped, reports) = result?;
        self.absorb(&reports);
        for idx in dropped.into_iter().rev() {
            if idx < self.nodes.len() {
                self.nodes.remove(idx);
            }
        }
        Ok(())
    }

    /// Returns the indices of members that were `node` and the migrations run.
    #[instrument(skip(self, node), fields(node = %node))]
    async fn remove_node_once(
        &self,
        node: &Node<C::Transport>,
    ) -> Result<(Vec<usize>, Vec<SlotMigrationReport>)> {
        let info = node.node_info().await?;
        let name = info.name.clone();

        let reports = if info.is_master() {
            self.migrate_node(node).await?
        } else {
            Vec::new()
        };

        let mut dropped = Vec::new();
        let mut remaining = Vec::new();
        for (idx, member) in self.nodes.iter().enumerate() {
            if member.name().await? == name {
                dropped.push(idx);
            } else {
                remaining.push(idx);
            }
        }

        let mut masters = Vec::new();
        for &idx in &remaining {
            let member = self.node(idx)?;
            let member_info = member.node_info().await?;
            if member_info.is_master() {
                let replicas = member.slaves(&member_info.name).await?.nodes.len();
                masters.push((replicas, member_info.name));
            }
        }
        masters.sort_by_key(|(replicas, _)| *replicas);

        for &idx in &remaining {
            let member = self.node(idx)?;
            if member.is_slave(Some(&name)).await? {
                let (_, adopter) = masters.first().ok_or_else(|| {
                    Error::Precondition(format!("no master left to adopt replicas of {}", name))
                })?;
                info!(replica = %member, master = %adopter, "Re-pointing replica");
                member.replicate(adopter).await?;
            }
            match member.forget(&name).await {
                Ok(()) => {}
                // Already forgotten by an earlier pass.
                Err(e) if e.is_unknown_node() => {
                    debug!(member = %member, id = %name, "Node already forgotten");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let left = node.slots().await?;
        if !left.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "{} still owns {} slots after evacuation",
                node,
                left.len()
            )));
        }

        node.reset(false).await?;
        info!(node = %node, id = %name, "Node removed");
        Ok((dropped, reports))
    }

    /// Work out which master receives which unowned slot.
    async fn fill_plan(&self) -> Result<FillPlan> {
        let mut masters = self.masters().await?;
        if masters.is_empty() {
            return Err(Error::Precondition("cluster has no master".to_string()));
        }

        let assigned: BTreeSet<u16> = masters
            .iter()
            .flat_map(|(_, info)| info.slots.iter().copied())
            .collect();
        let missing = missing_slots(self.config.total_slots, &assigned);
        masters.sort_by_key(|(_, info)| info.slots.len());

        let shares = divide(missing.len(), masters.len());
        let mut rest = missing.as_slice();
        let mut plan = Vec::with_capacity(masters.len());
        for ((idx, info), count) in masters.into_iter().zip(shares) {
            let (share, tail) = rest.split_at(count.min(rest.len()));
            rest = tail;
            if !share.is_empty() {
                plan.push((idx, info.name, share.to_vec()));
            }
        }
        Ok(plan)
    }

    /// ADDSLOTS every slot no master owns, least loaded masters first.
    ///
    /// Returns the number of slots assigned.
    #[instrument(skip(self))]
    pub async fn fill_slots(&self) -> Result<usize> {
        let mut filled = 0;
        for (idx, name, slots) in self.fill_plan().await? {
            debug!(node = %name, slots = slots.len(), "Adding slots");
            self.node(idx)?.add_slots(&slots).await?;
            filled += slots.len();
        }
        Ok(filled)
    }

    /// Like [`Cluster::fill_slots`], but binds each slot on every member with
    /// SETSLOT NODE.
    #[instrument(skip(self))]
    pub async fn bind_slots_force(&self) -> Result<usize> {
        let mut bound = 0;
        for (_, name, slots) in self.fill_plan().await? {
            for slot in slots {
                for member in &self.nodes {
                    match member.set_slot(SlotAction::Node, slot, Some(&name)).await {
                        Ok(()) => {}
                        Err(e) if e.is_replica_refusal() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                bound += 1;
            }
        }
        Ok(bound)
    }

    /// Make the instance at `slave` a replica of member `master_id`.
    #[instrument(skip(self))]
    pub async fn replicate(&mut self, slave: &NodeAddr, master_id: &str) -> Result<()> {
        let node = self.connector.connect(slave).await?;
        let member = self
            .nodes
            .first()
            .ok_or_else(|| Error::Precondition("cluster has no members".to_string()))?;

        node.meet(member.host(), member.port()).await?;
        self.nodes.push(node);
        self.wait().await?;

        let node = self
            .nodes
            .last()
            .ok_or_else(|| Error::InvariantViolation("replica vanished".to_string()))?;
        node.replicate(master_id).await?;
        info!(replica = %node, master = %master_id, "Replica attached");
        Ok(())
    }

    /// Flush every master concurrently, then hard-reset every member.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> Result<()> {
        let masters = self.masters().await?;
        let flushes = join_all(masters.iter().map(|(idx, _)| async move {
            self.node(*idx)?.flush_all().await.map_err(Error::from)
        }))
        .await;
        flushes.into_iter().collect::<Result<Vec<()>>>()?;

        for node in &self.nodes {
            node.reset(true).await?;
        }
        info!(nodes = self.nodes.len(), "Cluster destroyed");
        Ok(())
    }
}
