//! Node-level access to Valkey instances.
//!
//! This module wraps a single storage instance behind a narrow, typed control
//! surface. It handles addressing, the wire transport (the `fred` client in
//! production, anything implementing [`Transport`] in tests), error decoding
//! and parsing of the textual topology replies.
//!
//! ## Architecture
//!
//! - `transport`: [`Transport`] trait, [`Reply`], [`NodeError`] and the `fred` implementation
//! - `connector`: [`Connector`] trait turning a [`NodeAddr`] into a connected [`Node`]
//! - `node`: [`Node`] with one method per cluster-control command
//! - `types`: Parsed `CLUSTER NODES` / `CLUSTER INFO` output
//! - `parsing`: `INFO`-style key/value parsing
//!
//! ## Example
//!
//! ```rust,ignore
//! use valkey_clu::client::{Connector, FredConnector, NodeAddr, NodeConfig};
//!
//! let connector = FredConnector::new(NodeConfig::default());
//! let node = connector.connect(&NodeAddr::parse("127.0.0.1:7000")?).await?;
//! for member in node.nodes().await?.nodes {
//!     println!("{} {}", member.name, member.addr);
//! }
//! ```

pub mod addr;
pub mod connector;
pub mod node;
pub mod parsing;
pub mod transport;
pub mod types;

pub use addr::NodeAddr;
pub use connector::{Connector, FredConnector};
pub use node::{Node, SlotAction};
pub use transport::{
    Command, FredTransport, NodeConfig, NodeError, Redirect, Reply, Transport,
};
pub use types::{
    ClusterInfo, ClusterState, InfoMap, NodeFlags, NodeInfo, NodeRole, ParseError, Topology,
};
