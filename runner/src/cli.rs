use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    #[value(name = "run_all")]
    RunAll,
    #[value(name = "binlog_replicator")]
    BinlogReplicator,
    #[value(name = "db_replicator")]
    DbReplicator,
    #[value(name = "monitoring")]
    Monitoring,
    #[value(name = "db_optimizer")]
    DbOptimizer,
}

#[derive(Debug, Parser)]
#[command(
    name = "mysql_ch_sync",
    about = "MySQL to ClickHouse realtime replication"
)]
pub struct Args {
    /// run mode
    #[arg(value_enum)]
    pub mode: Mode,

    /// config file path
    #[arg(long, default_value = "config.yaml")]
    pub config: String,

    /// source database(s) name
    #[arg(long)]
    pub db: Option<String>,

    /// target database name, if not set will be same as source
    #[arg(long = "target_db")]
    pub target_db: Option<String>,

    /// in run_all mode, launch databases one by one waiting for each
    /// initial replication to finish
    #[arg(
        long = "wait_initial_replication",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub wait_initial_replication: bool,

    /// don't run realtime replication, run initial replication only
    #[arg(long = "initial_only")]
    pub initial_only: bool,

    /// worker ID for parallel initial replication (0-based)
    #[arg(long = "worker_id")]
    pub worker_id: Option<u32>,

    /// total number of workers for parallel initial replication
    #[arg(long = "total_workers")]
    pub total_workers: Option<u32>,

    /// specific table to process (used with --worker_id for parallel
    /// processing of a single table)
    #[arg(long)]
    pub table: Option<String>,

    /// FOR TESTING ONLY: exit initial replication after processing this
    /// many records
    #[arg(long = "initial-replication-test-fail-records")]
    pub initial_replication_test_fail_records: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_all() {
        let args =
            Args::try_parse_from(["mysql_ch_sync", "run_all", "--config", "cfg.yaml"]).unwrap();
        assert_eq!(args.mode, Mode::RunAll);
        assert_eq!(args.config, "cfg.yaml");
        assert!(args.wait_initial_replication);
        assert!(!args.initial_only);
    }

    #[test]
    fn test_parse_worker_invocation() {
        let args = Args::try_parse_from([
            "mysql_ch_sync",
            "db_replicator",
            "--config",
            "cfg.yaml",
            "--db",
            "shop",
            "--worker_id",
            "2",
            "--total_workers",
            "4",
            "--table",
            "orders",
            "--target_db",
            "shop_tmp",
            "--initial_only",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::DbReplicator);
        assert_eq!(args.db.as_deref(), Some("shop"));
        assert_eq!(args.worker_id, Some(2));
        assert_eq!(args.total_workers, Some(4));
        assert_eq!(args.table.as_deref(), Some("orders"));
        assert_eq!(args.target_db.as_deref(), Some("shop_tmp"));
        assert!(args.initial_only);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Args::try_parse_from(["mysql_ch_sync", "everything"]).is_err());
    }
}
