mod cli;
mod http;
mod monitoring;
mod supervisor;

use std::path::Path;

use clap::Parser;
use tracing::error;

use binlog::replicator::BinlogReplicator;
use common::config::Settings;
use common::err::CResult;
use common::log::init_log;
use replication::db_replicator::{DbReplicator, DbReplicatorOptions};
use replication::optimizer::DbOptimizer;

use crate::cli::{Args, Mode};
use crate::monitoring::Monitoring;
use crate::supervisor::Runner;

fn ensure_data_dir(config: &Settings) -> CResult<()> {
    std::fs::create_dir_all(Path::new(&config.binlog_replicator.data_dir))?;
    Ok(())
}

async fn run_binlog_replicator(config: Settings) -> CResult<()> {
    ensure_data_dir(&config)?;
    init_log("binlogrepl", &config.log_level);
    BinlogReplicator::new(config)?.run().await
}

async fn run_db_replicator(args: &Args, config: Settings) -> CResult<()> {
    let db_name = args
        .db
        .as_deref()
        .ok_or_else(|| common::err::ReplError::ConfigError(
            "need to pass --db argument".to_string(),
        ))?;
    ensure_data_dir(&config)?;
    std::fs::create_dir_all(
        Path::new(&config.binlog_replicator.data_dir).join(db_name),
    )?;

    let log_tag = match (args.worker_id, &args.table) {
        (Some(worker_id), Some(table)) => {
            format!("dbrepl {} worker_{} table_{}", db_name, worker_id, table)
        }
        (Some(worker_id), None) => format!("dbrepl {} worker_{}", db_name, worker_id),
        _ => format!("dbrepl {}", db_name),
    };
    init_log(&log_tag, &config.log_level);

    let options = DbReplicatorOptions {
        target_database: args.target_db.clone(),
        initial_only: args.initial_only,
        worker_id: args.worker_id,
        total_workers: args.total_workers,
        table: args.table.clone(),
        initial_replication_test_fail_records: args.initial_replication_test_fail_records,
    };
    DbReplicator::new(config, db_name, options)?.run().await
}

async fn run_db_optimizer(config: Settings) -> CResult<()> {
    ensure_data_dir(&config)?;
    init_log("dbopt", &config.log_level);
    DbOptimizer::new(config)?.run().await
}

async fn run_monitoring(args: &Args, config: Settings) -> CResult<()> {
    init_log("monitor", &config.log_level);
    Monitoring::new(args.db.as_deref().unwrap_or(""), config)
        .run()
        .await
}

async fn run_all(args: &Args, config: Settings) -> CResult<()> {
    ensure_data_dir(&config)?;
    init_log("runner", &config.log_level);
    Runner::new(config, args.wait_initial_replication, args.db.clone())
        .run()
        .await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Settings::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {}", args.config, err);
            std::process::exit(1);
        }
    };

    let result = match args.mode {
        Mode::BinlogReplicator => run_binlog_replicator(config).await,
        Mode::DbReplicator => run_db_replicator(&args, config).await,
        Mode::DbOptimizer => run_db_optimizer(config).await,
        Mode::Monitoring => run_monitoring(&args, config).await,
        Mode::RunAll => run_all(&args, config).await,
    };

    if let Err(err) = result {
        error!("fatal: {}", err);
        std::process::exit(1);
    }
}
