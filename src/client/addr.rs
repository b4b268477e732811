//! Node addressing.

use std::str::FromStr;

use super::transport::NodeError;

/// Default port for a Valkey instance.
pub const DEFAULT_PORT: u16 = 6379;

const SCHEMES: [&str; 4] = ["redis://", "rediss://", "valkey://", "valkeys://"];

/// `host:port` of a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    /// Host name or IP.
    pub host: String,
    /// Client port.
    pub port: u16,
}

impl NodeAddr {
    /// Create an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, optionally prefixed with a URI scheme.
    ///
    /// The `@cport` bus-port suffix printed by `CLUSTER NODES` is ignored.
    ///
    /// ```
    /// use valkey_clu::client::NodeAddr;
    ///
    /// let addr = NodeAddr::parse("valkey://10.0.0.1:7000").unwrap();
    /// assert_eq!(addr, NodeAddr::new("10.0.0.1", 7000));
    /// assert_eq!(NodeAddr::parse("cache").unwrap().port, 6379);
    /// ```
    pub fn parse(input: &str) -> Result<Self, NodeError> {
        let invalid = || NodeError::InvalidAddress(input.to_string());

        let mut rest = input.trim();
        if let Some(stripped) = SCHEMES.iter().find_map(|s| rest.strip_prefix(s)) {
            rest = stripped;
        }
        let rest = rest.trim_end_matches('/');
        let rest = rest.split_once('@').map_or(rest, |(addr, _)| addr);

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_PORT),
        };

        if host.is_empty() || port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl FromStr for NodeAddr {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
