//! Restart and resume behavior of the per-database state: worker state
//! file isolation, snapshot cursor progression, and version counter
//! seeding. Everything here runs offline; the replicator constructors do
//! not touch the network.

use std::cmp::Ordering;

use common::config::Settings;
use common::event::{BinlogPosition, ColumnValue};
use replication::converter::compare_values;
use replication::db_replicator::{DbReplicator, DbReplicatorOptions};
use replication::state::{DbState, Status};

fn settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.binlog_replicator.data_dir = dir.to_string_lossy().to_string();
    settings
}

#[test]
fn test_worker_state_files_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    let main = DbReplicator::state_path(&settings, "shop", None, None);
    let worker_0 = DbReplicator::state_path(&settings, "shop", Some((0, 4)), Some("orders"));
    let worker_1 = DbReplicator::state_path(&settings, "shop", Some((1, 4)), Some("orders"));
    let worker_0_other =
        DbReplicator::state_path(&settings, "shop", Some((0, 4)), Some("payments"));

    assert_ne!(main, worker_0);
    assert_ne!(worker_0, worker_1);
    assert_ne!(worker_0, worker_0_other);

    // each file holds its own cursor
    std::fs::create_dir_all(worker_0.parent().unwrap()).unwrap();
    let mut state_0 = DbState::load(&worker_0).unwrap();
    state_0.initial_replication_table = Some("orders".to_string());
    state_0.initial_replication_max_primary_key = Some(vec![ColumnValue::Int(100)]);
    state_0.save().unwrap();

    let mut state_1 = DbState::load(&worker_1).unwrap();
    state_1.initial_replication_table = Some("orders".to_string());
    state_1.initial_replication_max_primary_key = Some(vec![ColumnValue::Int(37)]);
    state_1.save().unwrap();

    let restored_0 = DbState::load(&worker_0).unwrap();
    assert_eq!(
        restored_0.initial_replication_max_primary_key,
        Some(vec![ColumnValue::Int(100)])
    );
    let restored_1 = DbState::load(&worker_1).unwrap();
    assert_eq!(
        restored_1.initial_replication_max_primary_key,
        Some(vec![ColumnValue::Int(37)])
    );
}

#[test]
fn test_snapshot_cursor_only_moves_forward() {
    // the cursor is the max primary-key tuple observed; pages may deliver
    // keys in any order within the batch
    let pages: Vec<Vec<Vec<ColumnValue>>> = vec![
        vec![vec![ColumnValue::Int(1)], vec![ColumnValue::Int(3)]],
        vec![vec![ColumnValue::Int(2)], vec![ColumnValue::Int(7)]],
        vec![vec![ColumnValue::Int(5)]],
    ];

    let mut cursor: Option<Vec<ColumnValue>> = None;
    let mut history = Vec::new();
    for page in &pages {
        for key in page {
            let advanced = match &cursor {
                Some(current) => compare_values(key, current) == Ordering::Greater,
                None => true,
            };
            if advanced {
                cursor = Some(key.clone());
            }
        }
        history.push(cursor.clone().unwrap());
    }

    assert_eq!(
        history,
        vec![
            vec![ColumnValue::Int(3)],
            vec![ColumnValue::Int(7)],
            vec![ColumnValue::Int(7)],
        ]
    );
}

#[test]
fn test_version_counters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    // a previous run wrote versions and persisted them
    let state_path = DbReplicator::state_path(&settings, "shop", None, None);
    std::fs::create_dir_all(state_path.parent().unwrap()).unwrap();
    let mut state = DbState::load(&state_path).unwrap();
    state.status = Status::RunningRealtimeReplication;
    state
        .tables_last_record_version
        .insert("orders".to_string(), 1234);
    state.last_processed_transaction = Some(BinlogPosition::new("mysql-bin.000009", 500));
    state.save().unwrap();

    // a fresh process seeds the target writer from the state blob, so the
    // next insert continues at 1235 and versions never move backward
    let replicator =
        DbReplicator::new(settings, "shop", DbReplicatorOptions::default()).unwrap();
    assert_eq!(replicator.clickhouse_api.get_last_used_version("orders"), 1234);
    assert_eq!(replicator.state.status, Status::RunningRealtimeReplication);
    assert_eq!(
        replicator.state.last_processed_transaction,
        Some(BinlogPosition::new("mysql-bin.000009", 500))
    );
    // the in-flight cursor restarts from the durable one
    assert_eq!(
        replicator.state.last_processed_transaction_non_uploaded,
        replicator.state.last_processed_transaction
    );
}

#[test]
fn test_suppress_deletes_skips_temporary_database() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.ignore_deletes = true;

    let replicator =
        DbReplicator::new(settings, "shop", DbReplicatorOptions::default()).unwrap();
    // replication goes straight into the final database, no `_tmp` swap
    assert_eq!(replicator.target_database_tmp, replicator.target_database);
}

#[test]
fn test_parallel_worker_writes_into_parent_temporary_database() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    let options = DbReplicatorOptions {
        target_database: Some("shop_tmp".to_string()),
        initial_only: true,
        worker_id: Some(1),
        total_workers: Some(4),
        table: Some("orders".to_string()),
        ..Default::default()
    };
    let replicator = DbReplicator::new(settings, "shop", options).unwrap();
    assert!(replicator.is_parallel_worker);
    // the worker never derives its own `_tmp` name on top of the parent's
    assert_eq!(replicator.target_database, "shop_tmp");
    assert_eq!(replicator.target_database_tmp, "shop_tmp");
}

#[test]
fn test_target_database_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings
        .target_databases
        .insert("shop".to_string(), "analytics_shop".to_string());

    let replicator =
        DbReplicator::new(settings, "shop", DbReplicatorOptions::default()).unwrap();
    assert_eq!(replicator.target_database, "analytics_shop");
    assert_eq!(replicator.target_database_tmp, "analytics_shop_tmp");
}
