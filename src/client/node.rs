//! One cluster member and its control surface.
//!
//! [`Node`] is an explicit, narrow interface over a [`Transport`]: every
//! cluster-control primitive the tool needs is a method here and nothing else
//! is forwarded. Topology-derived properties (`name`, `slots`, roles) are
//! re-fetched from `CLUSTER NODES` on every call; callers that need a stable
//! snapshot keep the returned [`NodeInfo`].

use std::collections::BTreeSet;

use tracing::{debug, instrument};

use super::addr::NodeAddr;
use super::parsing::parse_info_output;
use super::transport::{Command, NodeError, Reply, Transport};
use super::types::{ClusterInfo, InfoMap, NodeInfo, ParseError, Topology};
use crate::slots::migration::{MigrationOptions, SlotMigrationReport, migrate_slot};

/// Sub-command of `CLUSTER SETSLOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    /// Accept ASK-redirected requests for the slot from a source node.
    Importing,
    /// Redirect requests for keys no longer held to the destination.
    Migrating,
    /// Clear any migrating/importing state.
    Stable,
    /// Bind the slot to a node id.
    Node,
}

impl SlotAction {
    /// Wire keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotAction::Importing => "IMPORTING",
            SlotAction::Migrating => "MIGRATING",
            SlotAction::Stable => "STABLE",
            SlotAction::Node => "NODE",
        }
    }
}

impl std::fmt::Display for SlotAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected storage instance.
pub struct Node<T> {
    host: String,
    port: u16,
    transport: T,
}

impl<T> std::fmt::Display for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl<T> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Node<T> {
    /// Wrap an already connected transport.
    pub fn new(host: impl Into<String>, port: u16, transport: T) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
        }
    }

    /// Host (an IP once resolved by the connector).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Client port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of this node.
    pub fn addr(&self) -> NodeAddr {
        NodeAddr::new(self.host.clone(), self.port)
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn cluster(&self, subcommand: &str, args: Vec<String>) -> Result<Reply, NodeError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(subcommand.to_string());
        full.extend(args);
        self.transport.call("CLUSTER", full).await
    }

    /// This node's view of the whole cluster, `myself` first.
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn nodes(&self) -> Result<Topology, NodeError> {
        let text = self
            .cluster("NODES", Vec::new())
            .await?
            .into_text("CLUSTER NODES")?;
        Ok(Topology::parse(&text)?)
    }

    /// This node's own record.
    pub async fn node_info(&self) -> Result<NodeInfo, NodeError> {
        self.nodes()
            .await?
            .nodes
            .into_iter()
            .next()
            .filter(NodeInfo::is_myself)
            .ok_or_else(|| NodeError::Parse(ParseError::MissingField("myself".to_string())))
    }

    /// Node id.
    pub async fn name(&self) -> Result<String, NodeError> {
        Ok(self.node_info().await?.name)
    }

    /// Slots this node owns.
    pub async fn slots(&self) -> Result<BTreeSet<u16>, NodeError> {
        Ok(self.node_info().await?.slots)
    }

    /// Check whether this node reports itself as a master.
    pub async fn is_master(&self) -> Result<bool, NodeError> {
        Ok(self.node_info().await?.is_master())
    }

    /// Check whether this node is a replica, optionally of a specific master.
    pub async fn is_slave(&self, master_id: Option<&str>) -> Result<bool, NodeError> {
        let info = self.node_info().await?;
        Ok(info.is_slave()
            && master_id.is_none_or(|id| info.replicate.as_deref() == Some(id)))
    }

    /// `CLUSTER SETSLOT <slot> <action> [node_id]`.
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn set_slot(
        &self,
        action: SlotAction,
        slot: u16,
        node_id: Option<&str>,
    ) -> Result<(), NodeError> {
        let mut args = vec![slot.to_string(), action.as_str().to_string()];
        if let Some(id) = node_id {
            args.push(id.to_string());
        }
        self.cluster("SETSLOT", args).await?;
        Ok(())
    }

    /// `CLUSTER ADDSLOTS <slot>...`
    #[instrument(skip(self, slots), fields(node = %self, count = slots.len()), level = "debug")]
    pub async fn add_slots(&self, slots: &[u16]) -> Result<(), NodeError> {
        if slots.is_empty() {
            return Ok(());
        }
        let args = slots.iter().map(u16::to_string).collect();
        self.cluster("ADDSLOTS", args).await?;
        Ok(())
    }

    /// `CLUSTER FORGET <node_id>`
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn forget(&self, node_id: &str) -> Result<(), NodeError> {
        self.cluster("FORGET", vec![node_id.to_string()]).await?;
        Ok(())
    }

    /// `CLUSTER MEET <host> <port>`
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn meet(&self, host: &str, port: u16) -> Result<(), NodeError> {
        self.cluster("MEET", vec![host.to_string(), port.to_string()])
            .await?;
        Ok(())
    }

    /// `CLUSTER REPLICATE <master_id>`
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn replicate(&self, master_id: &str) -> Result<(), NodeError> {
        self.cluster("REPLICATE", vec![master_id.to_string()])
            .await?;
        Ok(())
    }

    /// `CLUSTER SET-CONFIG-EPOCH <epoch>`
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn set_config_epoch(&self, epoch: u64) -> Result<(), NodeError> {
        self.cluster("SET-CONFIG-EPOCH", vec![epoch.to_string()])
            .await?;
        Ok(())
    }

    /// `CLUSTER RESET HARD|SOFT`
    #[instrument(skip(self), fields(node = %self), level = "debug")]
    pub async fn reset(&self, hard: bool) -> Result<(), NodeError> {
        let mode = if hard { "HARD" } else { "SOFT" };
        self.cluster("RESET", vec![mode.to_string()]).await?;
        Ok(())
    }

    /// `CLUSTER COUNTKEYSINSLOT <slot>`
    pub async fn count_keys_in_slot(&self, slot: u16) -> Result<u64, NodeError> {
        let count = self
            .cluster("COUNTKEYSINSLOT", vec![slot.to_string()])
            .await?
            .into_integer("CLUSTER COUNTKEYSINSLOT")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// `CLUSTER GETKEYSINSLOT <slot> <count>`
    pub async fn get_keys_in_slot(&self, slot: u16, count: usize) -> Result<Vec<String>, NodeError> {
        self.cluster("GETKEYSINSLOT", vec![slot.to_string(), count.to_string()])
            .await?
            .into_text_array("CLUSTER GETKEYSINSLOT")
    }

    /// Send one `MIGRATE host port key 0 timeout` per key as a single
    /// non-transactional batch.
    ///
    /// Per-key outcomes are returned in order and never raised; a key that
    /// failed stays on this node for the next pass.
    #[instrument(skip(self, keys), fields(node = %self, keys = keys.len()), level = "debug")]
    pub async fn migrate_keys(
        &self,
        host: &str,
        port: u16,
        keys: &[String],
        timeout_ms: u64,
    ) -> Result<Vec<Result<Reply, NodeError>>, NodeError> {
        let commands: Vec<Command> = keys
            .iter()
            .map(|key| {
                (
                    "MIGRATE".to_string(),
                    vec![
                        host.to_string(),
                        port.to_string(),
                        key.clone(),
                        "0".to_string(),
                        timeout_ms.to_string(),
                    ],
                )
            })
            .collect();
        self.transport.call_many(commands).await
    }

    /// Move one of this node's slots to `dst`, then bind it to `dst` on
    /// every member of `cluster_nodes`.
    pub async fn migrate_slot(
        &self,
        dst: &Node<T>,
        slot: u16,
        cluster_nodes: &[Node<T>],
        options: &MigrationOptions,
    ) -> crate::error::Result<SlotMigrationReport> {
        migrate_slot(self, dst, slot, cluster_nodes, options).await
    }

    /// Replicas of `node_id`, parsed like `CLUSTER NODES`.
    pub async fn slaves(&self, node_id: &str) -> Result<Topology, NodeError> {
        let lines = match self.cluster("SLAVES", vec![node_id.to_string()]).await? {
            Reply::Array(items) => items
                .into_iter()
                .map(|i| i.into_text("CLUSTER SLAVES"))
                .collect::<Result<Vec<_>, _>>()?
                .join("\n"),
            other => other.into_optional_text("CLUSTER SLAVES")?.unwrap_or_default(),
        };
        Ok(Topology::parse(&lines)?)
    }

    /// `CLUSTER INFO`
    pub async fn cluster_info(&self) -> Result<ClusterInfo, NodeError> {
        let text = self
            .cluster("INFO", Vec::new())
            .await?
            .into_text("CLUSTER INFO")?;
        Ok(ClusterInfo::parse(&text)?)
    }

    /// `INFO [section]`
    pub async fn info(&self, section: Option<&str>) -> Result<InfoMap, NodeError> {
        let args = section.map(|s| vec![s.to_string()]).unwrap_or_default();
        let text = self.transport.call("INFO", args).await?.into_text("INFO")?;
        Ok(parse_info_output(&text)?)
    }

    /// `SELECT <db>`
    pub async fn select(&self, db: u32) -> Result<(), NodeError> {
        self.transport.call("SELECT", vec![db.to_string()]).await?;
        Ok(())
    }

    /// `RANDOMKEY`
    pub async fn random_key(&self) -> Result<Option<String>, NodeError> {
        self.transport
            .call("RANDOMKEY", Vec::new())
            .await?
            .into_optional_text("RANDOMKEY")
    }

    /// `PING`
    pub async fn ping(&self) -> Result<(), NodeError> {
        let reply = self.transport.call("PING", Vec::new()).await?;
        debug!(node = %self, ?reply, "Ping");
        Ok(())
    }

    /// `FLUSHALL`
    #[instrument(skip(self), fields(node = %self))]
    pub async fn flush_all(&self) -> Result<(), NodeError> {
        self.transport.call("FLUSHALL", Vec::new()).await?;
        Ok(())
    }
}
