//! Repair of interrupted slot migrations.
//!
//! A crash between SETSLOT MIGRATING and the final SETSLOT NODE leaves a slot
//! open on one or both sides. When both sides still agree the migration is
//! resumed; otherwise the stray marker is cleared with SETSLOT STABLE.

use tracing::{info, instrument, warn};

use super::Cluster;
use crate::client::{Connector, Node, SlotAction};
use crate::error::Result;
use crate::slots::{SlotMigrationReport, migrate_slot};

impl<C: Connector> Cluster<C> {
    /// Resolve every open slot on every master.
    #[instrument(skip(self))]
    pub async fn fix_open_slots(&self) -> Result<Vec<SlotMigrationReport>> {
        let mut reports = Vec::new();
        for (idx, _) in self.masters().await? {
            reports.extend(self.fix_node(self.node(idx)?).await?);
        }
        Ok(reports)
    }

    /// Resolve the open slots reported by `node`.
    #[instrument(skip(self, node), fields(node = %node))]
    pub async fn fix_node(&self, node: &Node<C::Transport>) -> Result<Vec<SlotMigrationReport>> {
        let info = node.node_info().await?;
        let options = self.config.migration_options();
        let mut reports = Vec::new();

        for (&slot, dst_id) in &info.migrating {
            let dst = self.get_node(dst_id).await?;
            let reciprocal = match dst {
                Some(dst) => dst.node_info().await?.importing.get(&slot) == Some(&info.name),
                None => false,
            };

            match dst {
                Some(dst) if reciprocal => {
                    info!(slot, destination = %dst, "Resuming migration");
                    reports.push(migrate_slot(node, dst, slot, &self.nodes, &options).await?);
                }
                _ => {
                    warn!(slot, destination = %dst_id, "Abandoning migration");
                    node.set_slot(SlotAction::Stable, slot, None).await?;
                }
            }
        }

        for (&slot, src_id) in &info.importing {
            let src = self.get_node(src_id).await?;
            let reciprocal = match src {
                Some(src) => src.node_info().await?.migrating.get(&slot) == Some(&info.name),
                None => false,
            };

            match src {
                Some(src) if reciprocal => {
                    info!(slot, source = %src, "Resuming migration");
                    reports.push(migrate_slot(src, node, slot, &self.nodes, &options).await?);
                }
                _ => {
                    warn!(slot, source = %src_id, "Abandoning import");
                    node.set_slot(SlotAction::Stable, slot, None).await?;
                }
            }
        }

        Ok(reports)
    }

    /// Resolve open slots, then assign any slot no master owns.
    pub async fn fix(&mut self) -> Result<()> {
        let reports = self.fix_open_slots().await?;
        self.absorb(&reports);
        let filled = self.fill_slots().await?;
        info!(resumed = reports.len(), filled, "Fix complete");
        Ok(())
    }
}
