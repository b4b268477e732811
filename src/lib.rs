//! valkey-clu library crate
//!
//! Topology management for Valkey/Redis clusters: bootstrap, rebalancing,
//! node add/remove, slot migration and open-slot repair.
//!
//! - [`client`]: one node's control surface and the wire transport
//! - [`slots`]: slot arithmetic, the balancer and the migration protocol
//! - [`cluster`]: cluster-wide operations built on the two above

pub mod client;
pub mod cluster;
pub mod error;
pub mod slots;

pub use client::{Connector, FredConnector, Node, NodeAddr, NodeConfig, NodeError};
pub use cluster::{Cluster, ClusterConfig, ClusterCreator, RetryPolicy, WaitPolicy};
pub use error::{Error, Result};
