//! Slot management for Valkey clusters.
//!
//! Computing "what slots to move" is kept apart from "how to move them".
//!
//! ## Module Structure
//!
//! - [`distribution`]: Pure slot distribution calculations (`divide`, ranges)
//! - [`planner`]: The balancer producing `(source, destination, count)` instructions
//! - [`migration`]: The single-slot migration protocol and its state tracker

pub mod distribution;
pub mod migration;
pub mod planner;

// Re-export commonly used types
pub use distribution::{SlotRange, TOTAL_SLOTS, compress_slots, divide, missing_slots, split_slots};
pub use migration::{
    MigrationOptions, MigrationState, SlotMigrationReport, SlotMigrationTracker, migrate_slot,
};
pub use planner::{Balance, BalancePlan, MasterLoad, MigrationInstruction, slot_balance};
