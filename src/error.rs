//! Operation-level errors.

use thiserror::Error;

use crate::client::NodeError;

/// Errors surfaced by cluster operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("cluster not consistent, run fix first")]
    NotConsistent,

    #[error("cluster not healthy, run fix first")]
    NotHealthy,

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("migration of slot {slot} aborted: {source}")]
    MigrationAborted {
        slot: u16,
        #[source]
        source: NodeError,
    },

    #[error("migration of slot {slot} made no progress after {batches} batches")]
    MigrationStalled { slot: u16, batches: usize },
}

impl Error {
    /// Check if this error is a transport timeout, directly or inside an
    /// aborted migration.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Node(e) | Error::MigrationAborted { source: e, .. } => e.is_timeout(),
            _ => false,
        }
    }

    /// Check if the operation may be retried as is.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }
}

impl From<crate::client::ParseError> for Error {
    fn from(e: crate::client::ParseError) -> Self {
        Error::Node(NodeError::Parse(e))
    }
}

/// Result alias for cluster operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
