//! Wire transport to a single Valkey node.
//!
//! The [`Transport`] trait is the narrow request/response surface the rest of
//! the crate talks to. Replies are converted into the closed [`Reply`] enum and
//! error text is decoded exactly once, here, into [`NodeError`] so callers can
//! branch on ASK/MOVED redirections without string matching.

use std::future::Future;
use std::time::Duration;

use fred::prelude::*;
use fred::types::{ClusterHash, CustomCommand};
use thiserror::Error;
use tracing::{debug, instrument};

use super::types::ParseError;

/// A redirection returned by a node for a key whose slot lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Slot is mid-migration; retry once against `addr` with ASKING.
    Ask {
        /// Slot of the key.
        slot: u16,
        /// `host:port` of the importing node.
        addr: String,
    },
    /// Slot has permanently moved to `addr`.
    Moved {
        /// Slot of the key.
        slot: u16,
        /// `host:port` of the new owner.
        addr: String,
    },
}

impl Redirect {
    /// Decode `ASK <slot> <host:port>` / `MOVED <slot> <host:port>`.
    ///
    /// Returns `None` for any other error text.
    pub fn decode(message: &str) -> Option<Self> {
        let mut parts = message.split_whitespace();
        let kind = parts.next()?;
        let slot: u16 = parts.next()?.parse().ok()?;
        let addr = parts.next()?;
        if parts.next().is_some() || !addr.contains(':') {
            return None;
        }

        let addr = addr.to_string();
        match kind {
            "ASK" => Some(Redirect::Ask { slot, addr }),
            "MOVED" => Some(Redirect::Moved { slot, addr }),
            _ => None,
        }
    }

    /// Slot carried by the redirection.
    pub fn slot(&self) -> u16 {
        match self {
            Redirect::Ask { slot, .. } | Redirect::Moved { slot, .. } => *slot,
        }
    }

    /// Target address carried by the redirection.
    pub fn addr(&self) -> &str {
        match self {
            Redirect::Ask { addr, .. } | Redirect::Moved { addr, .. } => addr,
        }
    }
}

impl std::fmt::Display for Redirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Redirect::Ask { slot, addr } => write!(f, "ASK {} {}", slot, addr),
            Redirect::Moved { slot, addr } => write!(f, "MOVED {} {}", slot, addr),
        }
    }
}

/// Errors that can occur during node operations.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Redirected: {0}")]
    Redirect(Redirect),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Response error: {0}")]
    Response(String),

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl NodeError {
    /// Decode raw error text returned by a node.
    pub fn from_response(message: impl Into<String>) -> Self {
        let message = message.into();
        match Redirect::decode(&message) {
            Some(redirect) => NodeError::Redirect(redirect),
            None => NodeError::Response(message),
        }
    }

    /// Check if this is an ASK or MOVED redirection.
    pub fn is_redirect(&self) -> bool {
        matches!(self, NodeError::Redirect(_))
    }

    /// Check if this is a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NodeError::Timeout(_))
    }

    /// Check if a replica refused a master-only SETSLOT.
    pub fn is_replica_refusal(&self) -> bool {
        matches!(self, NodeError::Response(message) if message.contains("SETSLOT only with masters"))
    }

    /// Check if the node does not know the id it was given.
    pub fn is_unknown_node(&self) -> bool {
        matches!(self, NodeError::Response(message) if message.contains("Unknown node"))
    }
}

impl From<fred::error::Error> for NodeError {
    fn from(e: fred::error::Error) -> Self {
        match e.kind() {
            fred::error::ErrorKind::Timeout => NodeError::Timeout(e.details().to_string()),
            fred::error::ErrorKind::IO | fred::error::ErrorKind::Canceled => {
                NodeError::Connection(e.details().to_string())
            }
            _ => NodeError::from_response(e.details()),
        }
    }
}

/// A typed reply from a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Null bulk / nil.
    Nil,
    /// Integer reply.
    Integer(i64),
    /// Simple or bulk string reply.
    Text(String),
    /// Array reply.
    Array(Vec<Reply>),
}

impl Reply {
    /// Status reply `OK`.
    pub fn ok() -> Self {
        Reply::Text("OK".to_string())
    }

    /// Interpret the reply as text.
    pub fn into_text(self, command: &str) -> Result<String, NodeError> {
        match self {
            Reply::Text(s) => Ok(s),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interpret the reply as an integer.
    pub fn into_integer(self, command: &str) -> Result<i64, NodeError> {
        match self {
            Reply::Integer(i) => Ok(i),
            Reply::Text(ref s) => s.trim().parse().map_err(|_| unexpected(command, &self)),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interpret the reply as an optional text value (nil -> `None`).
    pub fn into_optional_text(self, command: &str) -> Result<Option<String>, NodeError> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Text(s) => Ok(Some(s)),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interpret the reply as an array of text values.
    pub fn into_text_array(self, command: &str) -> Result<Vec<String>, NodeError> {
        match self {
            Reply::Nil => Ok(Vec::new()),
            Reply::Array(items) => items.into_iter().map(|i| i.into_text(command)).collect(),
            other => Err(unexpected(command, &other)),
        }
    }
}

fn unexpected(command: &str, reply: &Reply) -> NodeError {
    NodeError::UnexpectedReply {
        command: command.to_string(),
        reply: format!("{:?}", reply),
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Reply::Nil,
            Value::Integer(i) => Reply::Integer(i),
            Value::Boolean(b) => Reply::Integer(i64::from(b)),
            Value::Double(d) => Reply::Text(d.to_string()),
            Value::String(s) => Reply::Text(s.to_string()),
            Value::Bytes(b) => Reply::Text(String::from_utf8_lossy(&b).into_owned()),
            Value::Array(items) => Reply::Array(items.into_iter().map(Reply::from).collect()),
            other => Reply::Text(format!("{:?}", other)),
        }
    }
}

/// A single command: name plus arguments.
pub type Command = (String, Vec<String>);

/// Request/response surface of one node.
///
/// Implementations are not meant to be shared across concurrent callers;
/// fan-out work uses distinct transports.
pub trait Transport: Send + Sync {
    /// Send one command and wait for its reply.
    fn call(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> impl Future<Output = Result<Reply, NodeError>> + Send;

    /// Send several commands without transactional grouping.
    ///
    /// Per-command failures are returned in place, never raised. The outer
    /// error is reserved for failures of the batch itself.
    fn call_many(
        &self,
        commands: Vec<Command>,
    ) -> impl Future<Output = Result<Vec<Result<Reply, NodeError>>, NodeError>> + Send {
        async move {
            let mut results = Vec::with_capacity(commands.len());
            for (command, args) in commands {
                results.push(self.call(&command, args).await);
            }
            Ok(results)
        }
    }
}

/// Configuration for connecting to a single node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Command timeout.
    pub command_timeout: Duration,
    /// Password for authentication.
    pub password: Option<String>,
    /// Use TLS with the default rustls connector.
    pub tls: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(4),
            command_timeout: Duration::from_secs(4),
            password: None,
            tls: false,
        }
    }
}

impl NodeConfig {
    /// Set password.
    pub fn with_password(mut self, password: String) -> Self {
        self.password = Some(password);
        self
    }

    /// Enable or disable TLS.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Set connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// [`Transport`] backed by a centralized `fred` client.
pub struct FredTransport {
    client: Client,
}

impl FredTransport {
    /// Connect to a single node (not clustered).
    #[instrument(skip(config), fields(host = %host, port = %port, tls = config.tls))]
    pub async fn connect(host: &str, port: u16, config: &NodeConfig) -> Result<Self, NodeError> {
        let mut redis_config = Config {
            server: ServerConfig::Centralized {
                server: Server::new(host, port),
            },
            ..Default::default()
        };

        if let Some(ref password) = config.password {
            redis_config.password = Some(password.clone());
        }

        if config.tls {
            let tls_connector = TlsConnector::default_rustls()
                .map_err(|e| NodeError::Connection(format!("TLS error: {}", e)))?;
            redis_config.tls = Some(tls_connector.into());
        }

        let command_timeout = config.command_timeout;
        let connection_timeout = config.connection_timeout;

        let client = Builder::from_config(redis_config)
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = connection_timeout;
            })
            .build()?;

        client.init().await?;
        debug!("Connected to node");

        Ok(Self { client })
    }
}

fn custom_command(command: &str) -> CustomCommand {
    CustomCommand::new(command.to_string(), ClusterHash::FirstKey, false)
}

impl Transport for FredTransport {
    async fn call(&self, command: &str, args: Vec<String>) -> Result<Reply, NodeError> {
        let value: Value = self.client.custom(custom_command(command), args).await?;
        Ok(Reply::from(value))
    }

    async fn call_many(
        &self,
        commands: Vec<Command>,
    ) -> Result<Vec<Result<Reply, NodeError>>, NodeError> {
        let pipeline = self.client.pipeline();
        for (command, args) in commands {
            let _: () = pipeline.custom(custom_command(&command), args).await?;
        }

        let results = pipeline.try_all::<Value>().await;
        Ok(results
            .into_iter()
            .map(|r| r.map(Reply::from).map_err(NodeError::from))
            .collect())
    }
}
