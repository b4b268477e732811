//! Per-slot migration protocol against the simulator.

use valkey_clu::Error;
use valkey_clu::client::Redirect;
use valkey_clu::slots::migration::MAX_IDLE_BATCHES;
use valkey_clu::slots::{MigrationOptions, migrate_slot};

use crate::{Fault, FOREVER, SimCluster};

fn options(batch: usize) -> MigrationOptions {
    MigrationOptions {
        batch,
        ..MigrationOptions::default()
    }
}

/// Test that an empty slot still changes owner everywhere.
#[tokio::test]
async fn test_empty_slot_changes_owner() {
    let sim = SimCluster::with_masters(2, 16);
    let nodes = sim.nodes();

    let report = migrate_slot(&nodes[0], &nodes[1], 3, &nodes, &options(1))
        .await
        .unwrap();

    assert_eq!(report.slot, 3);
    assert_eq!(report.keys_migrated, 0);
    assert!(report.attempts.is_empty());
    assert!(!sim.owned(0).contains(&3));
    assert!(sim.owned(1).contains(&3));
    assert!(sim.sim_node(0).migrating.is_empty());
    assert!(sim.sim_node(1).importing.is_empty());
}

/// Test that keys follow the slot and batches respect the batch size.
#[tokio::test]
async fn test_keys_follow_the_slot() {
    let sim = SimCluster::with_masters(2, 16);
    sim.insert_keys(0, 5, 5);
    let nodes = sim.nodes();

    let report = migrate_slot(&nodes[0], &nodes[1], 5, &nodes, &options(2))
        .await
        .unwrap();

    assert_eq!(report.keys_migrated, 5);
    assert_eq!(sim.keys_in_slot(0, 5), 0);
    assert_eq!(sim.keys_in_slot(1, 5), 5);
    assert!(sim.owned(1).contains(&5));

    let fetches = sim.sent("CLUSTER GETKEYSINSLOT 5");
    assert_eq!(fetches.len(), 4);
    assert!(fetches.iter().all(|(_, line)| line.ends_with(" 2")));
}

/// Test the handshake order: IMPORTING, MIGRATING, transfers, then NODE.
#[tokio::test]
async fn test_handshake_order() {
    let sim = SimCluster::with_masters(2, 16);
    sim.insert_keys(0, 2, 1);
    let nodes = sim.nodes();
    let (a, b) = (sim.addr(0), sim.addr(1));
    sim.clear_log();

    migrate_slot(&nodes[0], &nodes[1], 2, &nodes, &options(1))
        .await
        .unwrap();

    let log = sim.log();
    let position = |addr: &str, prefix: &str| {
        log.iter()
            .position(|(at, line)| at == addr && line.starts_with(prefix))
            .unwrap()
    };
    let importing = position(&b, "CLUSTER SETSLOT 2 IMPORTING");
    let migrating = position(&a, "CLUSTER SETSLOT 2 MIGRATING");
    let transfer = position(&a, "MIGRATE");
    let bind_a = position(&a, "CLUSTER SETSLOT 2 NODE");
    let bind_b = position(&b, "CLUSTER SETSLOT 2 NODE");

    assert!(importing < migrating);
    assert!(migrating < transfer);
    assert!(transfer < bind_a);
    assert!(transfer < bind_b);
}

/// Test that ASK replies are recorded and the key is moved on a later batch.
#[tokio::test]
async fn test_ask_is_recorded_and_retried() {
    let sim = SimCluster::with_masters(2, 16);
    let keys = sim.insert_keys(0, 3, 5);
    sim.fault_key(&keys[0], Fault::Ask, 1);
    let nodes = sim.nodes();

    let report = migrate_slot(&nodes[0], &nodes[1], 3, &nodes, &options(2))
        .await
        .unwrap();

    assert_eq!(report.keys_migrated, 5);
    assert_eq!(
        report.attempts,
        vec![Redirect::Ask {
            slot: 3,
            addr: sim.addr(1),
        }]
    );
    assert_eq!(sim.keys_in_slot(1, 3), 5);
}

/// Test that MOVED replies are tolerated like ASK.
#[tokio::test]
async fn test_moved_is_tolerated() {
    let sim = SimCluster::with_masters(2, 16);
    let keys = sim.insert_keys(0, 4, 2);
    sim.fault_key(&keys[1], Fault::Moved, 2);
    let nodes = sim.nodes();

    let report = migrate_slot(&nodes[0], &nodes[1], 4, &nodes, &options(1))
        .await
        .unwrap();

    assert_eq!(report.keys_migrated, 2);
    assert_eq!(report.attempts.len(), 2);
    assert!(
        report
            .attempts
            .iter()
            .all(|r| matches!(r, Redirect::Moved { slot: 4, .. }))
    );
}

/// Test that a non-redirect error leaves the slot open and aborts.
#[tokio::test]
async fn test_other_error_aborts() {
    let sim = SimCluster::with_masters(2, 16);
    let keys = sim.insert_keys(0, 6, 3);
    sim.fault_key(&keys[1], Fault::Error, 1);
    let nodes = sim.nodes();

    let err = migrate_slot(&nodes[0], &nodes[1], 6, &nodes, &options(3))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MigrationAborted { slot: 6, .. }));
    assert!(sim.owned(0).contains(&6));
    assert_eq!(sim.sim_node(0).migrating.get(&6), Some(&sim.id(1)));
    assert_eq!(sim.sim_node(1).importing.get(&6), Some(&sim.id(0)));
    assert!(sim.sent("CLUSTER SETSLOT 6 NODE").is_empty());
}

/// Test that a key that never moves trips the stall guard.
#[tokio::test]
async fn test_stalled_migration_gives_up() {
    let sim = SimCluster::with_masters(2, 16);
    let keys = sim.insert_keys(0, 1, 1);
    sim.fault_key(&keys[0], Fault::Ask, FOREVER);
    let nodes = sim.nodes();

    let err = migrate_slot(&nodes[0], &nodes[1], 1, &nodes, &options(1))
        .await
        .unwrap_err();

    match err {
        Error::MigrationStalled { slot, batches } => {
            assert_eq!(slot, 1);
            assert_eq!(batches, MAX_IDLE_BATCHES);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(sim.keys_in_slot(0, 1), 1);
}

/// Test that running the protocol again on an open slot finishes it.
#[tokio::test]
async fn test_rerun_resumes_open_slot() {
    let sim = SimCluster::with_masters(2, 16);
    let keys = sim.insert_keys(0, 7, 4);
    sim.fault_key(&keys[2], Fault::Error, 1);
    let nodes = sim.nodes();

    migrate_slot(&nodes[0], &nodes[1], 7, &nodes, &options(4))
        .await
        .unwrap_err();
    let report = migrate_slot(&nodes[0], &nodes[1], 7, &nodes, &options(4))
        .await
        .unwrap();

    // The failed batch still moved the keys around the failing one.
    assert_eq!(report.keys_migrated, 1);
    assert_eq!(sim.keys_in_slot(1, 7), 4);
    assert!(sim.owned(1).contains(&7));
}

/// Test the node-level entry point delegates to the same protocol.
#[tokio::test]
async fn test_node_migrate_slot() {
    let sim = SimCluster::with_masters(2, 16);
    sim.insert_keys(1, 12, 2);
    let nodes = sim.nodes();

    let report = nodes[1]
        .migrate_slot(&nodes[0], 12, &nodes, &options(10))
        .await
        .unwrap();

    assert_eq!(report.keys_migrated, 2);
    assert!(sim.owned(0).contains(&12));
}
