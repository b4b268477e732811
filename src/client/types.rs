//! Types for parsed Valkey cluster information.
//!
//! These types represent the parsed output of `CLUSTER NODES` and
//! `CLUSTER INFO`. Parsing is strict: a topology line with missing fields or
//! an unreadable slot token fails the whole parse, since no decision can be
//! made on a partial view.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use thiserror::Error;

use crate::slots::distribution::{SlotRange, compress_slots};

/// Number of positional fields before the slot list in a `CLUSTER NODES` line.
const FIXED_FIELDS: usize = 8;

/// Errors that can occur when parsing cluster data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid cluster info format: {0}")]
    InvalidClusterInfo(String),
    #[error("Invalid cluster nodes format: {0}")]
    InvalidClusterNodes(String),
    #[error("Invalid slot token: {0}")]
    InvalidSlot(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),
}

/// State of the Valkey cluster as reported by `cluster_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Cluster is healthy and serving requests.
    Ok,
    /// Cluster is in a failed state.
    Fail,
}

impl FromStr for ClusterState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ok" => Ok(ClusterState::Ok),
            "fail" => Ok(ClusterState::Fail),
            _ => Err(ParseError::InvalidClusterInfo(format!(
                "Unknown cluster state: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Ok => write!(f, "ok"),
            ClusterState::Fail => write!(f, "fail"),
        }
    }
}

/// Parsed output of `CLUSTER INFO`.
///
/// `cluster_state` is kept as a typed state; every other field is an integer.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Current state of the cluster.
    pub state: ClusterState,
    /// All remaining numeric fields keyed by name.
    pub values: BTreeMap<String, i64>,
}

impl ClusterInfo {
    /// Parse the output of `CLUSTER INFO`.
    pub fn parse(info: &str) -> Result<Self, ParseError> {
        let raw = crate::client::parsing::parse_info_output(info)?;

        let state = raw
            .get("cluster_state")
            .ok_or_else(|| ParseError::MissingField("cluster_state".to_string()))?
            .parse()?;

        let values = raw
            .iter()
            .filter(|(key, _)| key.as_str() != "cluster_state")
            .map(|(key, value)| {
                value
                    .trim()
                    .parse::<i64>()
                    .map(|v| (key.clone(), v))
                    .map_err(|_| {
                        ParseError::InvalidClusterInfo(format!("Invalid {} value: {}", key, value))
                    })
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(ClusterInfo { state, values })
    }

    /// Get a numeric field by name.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    /// Number of nodes this node knows about, itself included.
    pub fn known_nodes(&self) -> Option<i64> {
        self.get("cluster_known_nodes")
    }

    /// Number of slots this node sees as assigned.
    pub fn slots_assigned(&self) -> Option<i64> {
        self.get("cluster_slots_assigned")
    }
}

/// Role of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Node is a master serving hash slots.
    Master,
    /// Node is a replica of a master.
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Replica => write!(f, "slave"),
        }
    }
}

/// Flags indicating the state of a cluster node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// This is the local node (myself).
    pub myself: bool,
    /// Node is a master.
    pub master: bool,
    /// Node is a replica.
    pub slave: bool,
    /// Node is in PFAIL state (potentially failed).
    pub pfail: bool,
    /// Node is in FAIL state.
    pub fail: bool,
    /// Node is in handshake state.
    pub handshake: bool,
    /// Node has no address yet.
    pub noaddr: bool,
}

impl NodeFlags {
    /// Parse flags from the CLUSTER NODES output.
    pub fn parse(flags_str: &str) -> Self {
        let mut flags = NodeFlags::default();
        for flag in flags_str.split(',') {
            match flag.trim() {
                "myself" => flags.myself = true,
                "master" => flags.master = true,
                "slave" | "replica" => flags.slave = true,
                "pfail" | "fail?" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                _ => {}
            }
        }
        flags
    }

    /// Get the role based on flags.
    pub fn role(&self) -> NodeRole {
        if self.master {
            NodeRole::Master
        } else {
            NodeRole::Replica
        }
    }
}

/// One cluster member as seen by the node that produced the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node ID assigned by the instance.
    pub name: String,
    /// Address as printed, e.g. `127.0.0.1:7000@17000`.
    pub addr: String,
    /// Node flags.
    pub flags: NodeFlags,
    /// Master node ID if this is a replica.
    pub replicate: Option<String>,
    /// Ping sent timestamp.
    pub ping_sent: i64,
    /// Pong received timestamp.
    pub ping_recv: i64,
    /// Config epoch.
    pub config_epoch: i64,
    /// Link status ("connected" or "disconnected").
    pub link_status: String,
    /// Slots owned by this node.
    pub slots: BTreeSet<u16>,
    /// Slots this node is migrating, keyed by slot, valued by destination id.
    pub migrating: BTreeMap<u16, String>,
    /// Slots this node is importing, keyed by slot, valued by source id.
    pub importing: BTreeMap<u16, String>,
}

impl NodeInfo {
    /// Check if this is a master node.
    pub fn is_master(&self) -> bool {
        self.flags.master
    }

    /// Check if this is a replica node.
    pub fn is_slave(&self) -> bool {
        self.flags.slave
    }

    /// Check if this is the local node.
    pub fn is_myself(&self) -> bool {
        self.flags.myself
    }

    /// Check if the link to this node is up.
    pub fn is_connected(&self) -> bool {
        self.link_status != "disconnected"
    }

    /// Owned slots as contiguous ranges.
    pub fn slot_ranges(&self) -> Vec<SlotRange> {
        compress_slots(&self.slots)
    }

    /// Parse a single line from `CLUSTER NODES` output.
    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < FIXED_FIELDS {
            return Err(ParseError::InvalidClusterNodes(format!(
                "expected at least {} fields, got {}: {}",
                FIXED_FIELDS,
                parts.len(),
                line
            )));
        }

        let int_field = |idx: usize, name: &str| -> Result<i64, ParseError> {
            parts[idx].parse().map_err(|_| {
                ParseError::InvalidClusterNodes(format!("Invalid {}: {}", name, parts[idx]))
            })
        };

        let mut info = NodeInfo {
            name: parts[0].to_string(),
            addr: parts[1].to_string(),
            flags: NodeFlags::parse(parts[2]),
            replicate: match parts[3] {
                "-" => None,
                id => Some(id.to_string()),
            },
            ping_sent: int_field(4, "ping_sent")?,
            ping_recv: int_field(5, "ping_recv")?,
            config_epoch: int_field(6, "config_epoch")?,
            link_status: parts[7].to_string(),
            slots: BTreeSet::new(),
            migrating: BTreeMap::new(),
            importing: BTreeMap::new(),
        };

        for token in &parts[FIXED_FIELDS..] {
            info.add_slot_token(token)?;
        }

        Ok(info)
    }

    fn add_slot_token(&mut self, token: &str) -> Result<(), ParseError> {
        let invalid = || ParseError::InvalidSlot(token.to_string());
        let parse_slot = |s: &str| s.parse::<u16>().map_err(|_| invalid());

        if let Some(inner) = token.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
            if let Some((slot, dst)) = inner.split_once("->-") {
                self.migrating.insert(parse_slot(slot)?, dst.to_string());
            } else if let Some((slot, src)) = inner.split_once("-<-") {
                self.importing.insert(parse_slot(slot)?, src.to_string());
            } else {
                return Err(invalid());
            }
        } else if let Some((start, end)) = token.split_once('-') {
            let (start, end) = (parse_slot(start)?, parse_slot(end)?);
            if start > end {
                return Err(invalid());
            }
            self.slots.extend(start..=end);
        } else {
            self.slots.insert(parse_slot(token)?);
        }

        Ok(())
    }
}

/// Parsed output of `CLUSTER NODES`, the `myself` record first.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// All nodes in the view.
    pub nodes: Vec<NodeInfo>,
}

impl Topology {
    /// Parse the output of `CLUSTER NODES` (or the lines of `CLUSTER SLAVES`).
    pub fn parse(output: &str) -> Result<Self, ParseError> {
        let mut nodes: Vec<NodeInfo> = Vec::new();

        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let info = NodeInfo::parse_line(line)?;
            if info.is_myself() {
                nodes.insert(0, info);
            } else {
                nodes.push(info);
            }
        }

        Ok(Topology { nodes })
    }

    /// The record describing the node that produced this view.
    pub fn myself(&self) -> Option<&NodeInfo> {
        self.nodes.first().filter(|n| n.is_myself())
    }

    /// Get all master nodes.
    pub fn masters(&self) -> Vec<&NodeInfo> {
        self.nodes.iter().filter(|n| n.is_master()).collect()
    }

    /// Get replicas of a specific master.
    pub fn replicas_of(&self, master_id: &str) -> Vec<&NodeInfo> {
        self.nodes
            .iter()
            .filter(|n| n.replicate.as_deref() == Some(master_id))
            .collect()
    }

    /// Get a node by its ID.
    pub fn get_node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == node_id)
    }

    /// Canonical text of this view: sorted node names and sorted slots.
    ///
    /// Two nodes with converged gossip produce identical text.
    pub fn signature(&self) -> String {
        let mut names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort_unstable();

        let mut slots: Vec<u16> = self
            .nodes
            .iter()
            .flat_map(|n| n.slots.iter().copied())
            .collect();
        slots.sort_unstable();

        let slots: Vec<String> = slots.iter().map(|s| s.to_string()).collect();
        format!("{}:{}", names.join("|"), slots.join(","))
    }
}

/// Key/value lines as returned by `INFO`.
pub type InfoMap = HashMap<String, String>;
