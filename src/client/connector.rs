//! Opening connections to nodes.

use std::future::Future;

use tracing::{debug, instrument};

use super::addr::NodeAddr;
use super::node::Node;
use super::transport::{FredTransport, NodeConfig, NodeError, Transport};

/// Turns an address into a connected [`Node`].
///
/// `Cluster` holds one of these so it can reach members it discovers or is
/// told about after construction.
pub trait Connector: Send + Sync {
    /// Transport produced for each node.
    type Transport: Transport;

    /// Connect to `addr` and verify it answers.
    fn connect(
        &self,
        addr: &NodeAddr,
    ) -> impl Future<Output = Result<Node<Self::Transport>, NodeError>> + Send;
}

/// [`Connector`] backed by `fred`.
#[derive(Debug, Clone, Default)]
pub struct FredConnector {
    config: NodeConfig,
}

impl FredConnector {
    /// Create a connector using `config` for every node.
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Per-node connection settings.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

impl Connector for FredConnector {
    type Transport = FredTransport;

    #[instrument(skip(self), fields(addr = %addr))]
    async fn connect(&self, addr: &NodeAddr) -> Result<Node<FredTransport>, NodeError> {
        // CLUSTER MEET only accepts IPs
        let ip = tokio::net::lookup_host((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| NodeError::Connection(format!("resolve {}: {}", addr, e)))?
            .next()
            .map(|sock| sock.ip().to_string())
            .ok_or_else(|| NodeError::InvalidAddress(addr.to_string()))?;

        let transport = FredTransport::connect(&ip, addr.port, &self.config).await?;
        let node = Node::new(ip, addr.port, transport);
        node.ping().await?;
        debug!(node = %node, "Node reachable");

        Ok(node)
    }
}
