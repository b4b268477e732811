//! Single-slot migration protocol.
//!
//! 1. SETSLOT IMPORTING on the destination
//! 2. SETSLOT MIGRATING on the source
//! 3. GETKEYSINSLOT / MIGRATE in batches until the slot is empty
//! 4. SETSLOT NODE on every cluster member (replicas refuse it and are skipped)
//!
//! ASK/MOVED outcomes of individual MIGRATE calls are expected while clients
//! keep writing and are reported back, not raised. Any other key-transfer
//! error aborts the slot; `fix` resumes it later. There is no internal retry.

use tracing::{debug, info, warn};

use crate::client::{Node, NodeError, Redirect, SlotAction, Transport};
use crate::error::{Error, Result};

/// Consecutive batches without a single transferred key before giving up.
pub const MAX_IDLE_BATCHES: usize = 100;

/// State of a single slot migration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MigrationState {
    /// Migration not started.
    #[default]
    Pending,
    /// Destination accepts the slot (SETSLOT IMPORTING sent).
    Importing,
    /// Source redirects the slot (SETSLOT MIGRATING sent).
    Migrating,
    /// Keys are being transferred.
    TransferringKeys {
        /// Keys moved so far.
        moved: u64,
        /// Batches sent so far.
        batches: usize,
    },
    /// Slot drained, ownership being broadcast.
    Finalizing,
    /// Migration complete.
    Complete,
    /// Migration failed.
    Failed {
        /// Error description.
        error: String,
    },
}

impl MigrationState {
    /// Check if the migration completed successfully.
    pub fn is_complete(&self) -> bool {
        matches!(self, MigrationState::Complete)
    }

    /// Check if the migration failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, MigrationState::Failed { .. })
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Pending => write!(f, "pending"),
            MigrationState::Importing => write!(f, "importing"),
            MigrationState::Migrating => write!(f, "migrating"),
            MigrationState::TransferringKeys { moved, batches } => {
                write!(f, "transferring ({} keys, {} batches)", moved, batches)
            }
            MigrationState::Finalizing => write!(f, "finalizing"),
            MigrationState::Complete => write!(f, "complete"),
            MigrationState::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Tracks the progress of one slot migration.
#[derive(Debug, Clone)]
pub struct SlotMigrationTracker {
    /// The slot being migrated.
    pub slot: u16,
    /// Source node id.
    pub source_node: String,
    /// Destination node id.
    pub target_node: String,
    /// Current state of the migration.
    pub state: MigrationState,
    /// Total keys migrated so far.
    pub keys_migrated: u64,
    /// Batches sent so far.
    pub batches: usize,
    /// Batches in a row that moved nothing.
    pub idle_batches: usize,
}

impl SlotMigrationTracker {
    /// Create a new migration tracker.
    pub fn new(slot: u16, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            slot,
            source_node: source.into(),
            target_node: target.into(),
            state: MigrationState::Pending,
            keys_migrated: 0,
            batches: 0,
            idle_batches: 0,
        }
    }

    /// Transition to the next state.
    pub fn advance(&mut self, next: MigrationState) {
        debug!(slot = self.slot, from = %self.state, to = %next, "Slot migration state");
        self.state = next;
    }

    /// Record the outcome of one batch.
    pub fn record_batch(&mut self, moved: u64) {
        self.keys_migrated += moved;
        self.batches += 1;
        self.idle_batches = if moved == 0 { self.idle_batches + 1 } else { 0 };
        self.state = MigrationState::TransferringKeys {
            moved: self.keys_migrated,
            batches: self.batches,
        };
    }

    /// Check if too many batches in a row moved nothing.
    pub fn is_stalled(&self) -> bool {
        self.idle_batches >= MAX_IDLE_BATCHES
    }

    /// Mark as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = MigrationState::Failed {
            error: error.into(),
        };
    }

    /// Mark as complete.
    pub fn complete(&mut self) {
        self.state = MigrationState::Complete;
    }

    /// Check if the migration completed successfully.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Check if the migration failed.
    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }
}

/// Batch sizing for key transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Keys fetched per GETKEYSINSLOT.
    pub batch: usize,
    /// MIGRATE timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch: 1,
            timeout_ms: 15000,
        }
    }
}

/// Outcome of a completed slot migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMigrationReport {
    /// Migrated slot.
    pub slot: u16,
    /// Keys transferred by this run.
    pub keys_migrated: u64,
    /// Redirections tolerated during transfer.
    pub attempts: Vec<Redirect>,
}

/// Move `slot` from `src` to `dst` and bind it to `dst` on every node in
/// `cluster_nodes`.
///
/// `src` must own the slot. Re-running on a slot already marked
/// IMPORTING/MIGRATING between the same pair resumes it.
pub async fn migrate_slot<T: Transport>(
    src: &Node<T>,
    dst: &Node<T>,
    slot: u16,
    cluster_nodes: &[Node<T>],
    options: &MigrationOptions,
) -> Result<SlotMigrationReport> {
    let src_name = src.name().await?;
    let dst_name = dst.name().await?;
    let mut tracker = SlotMigrationTracker::new(slot, src_name.as_str(), dst_name.as_str());
    let mut attempts = Vec::new();

    dst.set_slot(SlotAction::Importing, slot, Some(&src_name))
        .await?;
    tracker.advance(MigrationState::Importing);
    src.set_slot(SlotAction::Migrating, slot, Some(&dst_name))
        .await?;
    tracker.advance(MigrationState::Migrating);

    loop {
        let keys = src.get_keys_in_slot(slot, options.batch.max(1)).await?;
        if keys.is_empty() {
            break;
        }

        let outcomes = src
            .migrate_keys(dst.host(), dst.port(), &keys, options.timeout_ms)
            .await?;

        let mut moved = 0;
        for outcome in outcomes {
            match outcome {
                Ok(_) => moved += 1,
                Err(NodeError::Redirect(redirect)) => {
                    warn!(slot, %redirect, "Key redirected during migration");
                    attempts.push(redirect);
                }
                Err(source) => {
                    tracker.fail(source.to_string());
                    return Err(Error::MigrationAborted { slot, source });
                }
            }
        }

        tracker.record_batch(moved);
        if tracker.is_stalled() {
            tracker.fail("no progress");
            return Err(Error::MigrationStalled {
                slot,
                batches: tracker.idle_batches,
            });
        }
    }

    tracker.advance(MigrationState::Finalizing);
    for node in cluster_nodes {
        match node.set_slot(SlotAction::Node, slot, Some(&dst_name)).await {
            Ok(()) => {}
            Err(e) if e.is_replica_refusal() => {
                debug!(slot, node = %node, "Replica follows its master for slot ownership");
            }
            Err(e) => return Err(e.into()),
        }
    }
    tracker.complete();

    info!(
        slot,
        source = %src,
        destination = %dst,
        keys = tracker.keys_migrated,
        "Slot migrated"
    );

    Ok(SlotMigrationReport {
        slot,
        keys_migrated: tracker.keys_migrated,
        attempts,
    })
}
