use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use common::config::Settings;
use common::err::CResult;
use event_log::reader::EventLogReader;

use crate::clickhouse_api::ClickhouseApi;
use crate::converter::MysqlToClickhouseConverter;
use crate::initial::DbReplicatorInitial;
use crate::mysql_api::MySQLApi;
use crate::realtime::DbReplicatorRealtime;
use crate::state::{DbState, Status};

/// Launch options of a per-database replicator process.
#[derive(Debug, Default, Clone)]
pub struct DbReplicatorOptions {
    pub target_database: Option<String>,
    pub initial_only: bool,
    pub worker_id: Option<u32>,
    pub total_workers: Option<u32>,
    pub table: Option<String>,
    /// test hook: stop the snapshot scan after this many records
    pub initial_replication_test_fail_records: Option<u64>,
}

/// Replicates one MySQL database into ClickHouse: initial snapshot first,
/// then realtime application of the staged event log.
pub struct DbReplicator {
    pub config: Settings,
    pub database: String,
    pub target_database: String,
    pub target_database_tmp: String,
    pub initial_only: bool,
    pub worker_id: Option<u32>,
    pub total_workers: Option<u32>,
    pub single_table: Option<String>,
    pub is_parallel_worker: bool,
    pub initial_replication_test_fail_records: Option<u64>,

    pub mysql_api: MySQLApi,
    pub clickhouse_api: ClickhouseApi,
    pub converter: MysqlToClickhouseConverter,
    pub data_reader: EventLogReader,
    pub state: DbState,
}

impl DbReplicator {
    pub fn new(config: Settings, database: &str, options: DbReplicatorOptions) -> CResult<Self> {
        let mut target_database = config.target_database(database);
        if let Some(from_cli) = &options.target_database {
            target_database = from_cli.clone();
        }

        let is_parallel_worker =
            options.worker_id.is_some() && options.total_workers.is_some();

        let state_path = Self::state_path(
            &config,
            database,
            options.worker_id.zip(options.total_workers),
            options.table.as_deref(),
        );
        std::fs::create_dir_all(
            state_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
        )?;
        if let Some(worker_id) = options.worker_id {
            info!(
                "worker {}/{} using state file: {:?}",
                worker_id,
                options.total_workers.unwrap_or(0),
                state_path
            );
        }

        // parallel workers write straight into the temporary database the
        // parent created, and never swap
        let target_database_tmp = if is_parallel_worker || config.ignore_deletes {
            target_database.clone()
        } else {
            format!("{}_tmp", target_database)
        };

        let mysql_api = MySQLApi::new(Some(database.to_string()), &config.mysql);
        let mut clickhouse_api = ClickhouseApi::new(Some(&target_database), &config.clickhouse)?;
        let converter =
            MysqlToClickhouseConverter::new(config.clone(), database, &target_database);
        let data_reader = EventLogReader::new(&config.binlog_replicator, database);
        let state = DbState::load(&state_path)?;
        // the writer's version counters live in the state blob
        clickhouse_api.tables_last_record_version = state.tables_last_record_version.clone();

        Ok(DbReplicator {
            config,
            database: database.to_string(),
            target_database,
            target_database_tmp,
            initial_only: options.initial_only,
            worker_id: options.worker_id,
            total_workers: options.total_workers,
            single_table: options.table,
            is_parallel_worker,
            initial_replication_test_fail_records: options
                .initial_replication_test_fail_records,
            mysql_api,
            clickhouse_api,
            converter,
            data_reader,
            state,
        })
    }

    /// `state.pckl` for the main replicator;
    /// `state_worker_<i>_of_<N>_<tablehash>.pckl` for parallel workers.
    pub fn state_path(
        config: &Settings,
        database: &str,
        worker: Option<(u32, u32)>,
        table: Option<&str>,
    ) -> PathBuf {
        let db_dir = PathBuf::from(&config.binlog_replicator.data_dir).join(database);
        match worker {
            Some((worker_id, total_workers)) => {
                let table_identifier = match table {
                    Some(table) => {
                        let digest = Sha256::digest(table.as_bytes());
                        let hex: String =
                            digest.iter().map(|b| format!("{:02x}", b)).collect();
                        hex[..16].to_string()
                    }
                    None => "all_tables".to_string(),
                };
                db_dir.join(format!(
                    "state_worker_{}_of_{}_{}.pckl",
                    worker_id, total_workers, table_identifier
                ))
            }
            None => db_dir.join("state.pckl"),
        }
    }

    pub async fn run(&mut self) -> CResult<()> {
        info!("launched db_replicator for {}", self.database);

        if self.state.status != Status::None {
            // a vanished target database forces a rebuild from scratch
            let databases = self.clickhouse_api.get_databases().await?;
            if !databases.contains(&self.target_database)
                && !databases.contains(&format!("{}_tmp", self.target_database))
            {
                warn!(
                    "database {} missing in clickhouse, will run replication from scratch",
                    self.target_database
                );
                let state_path = self.state.file_name().to_path_buf();
                self.state.remove()?;
                self.state = DbState::load(&state_path)?;
                self.clickhouse_api.tables_last_record_version.clear();
            }
        }

        match self.state.status {
            Status::RunningRealtimeReplication => {
                DbReplicatorRealtime::new(self).run().await
            }
            Status::PerformingInitialReplication => {
                DbReplicatorInitial::new(self).perform_initial_replication().await?;
                DbReplicatorRealtime::new(self).run().await
            }
            Status::None | Status::CreatingInitialStructures => {
                self.bootstrap().await?;
                DbReplicatorInitial::new(self).create_initial_structure().await?;
                DbReplicatorInitial::new(self).perform_initial_replication().await?;
                DbReplicatorRealtime::new(self).run().await
            }
        }
    }

    async fn bootstrap(&mut self) -> CResult<()> {
        if self.config.ignore_deletes {
            // no temporary database and no swap, replicate in place
            info!("using existing database (ignore_deletes=true)");
            self.clickhouse_api.database = Some(self.target_database.clone());
            self.target_database_tmp = self.target_database.clone();
            let databases = self.clickhouse_api.get_databases().await?;
            if !databases.contains(&self.target_database) {
                info!("creating database {}", self.target_database);
                self.clickhouse_api
                    .create_database(&self.target_database)
                    .await?;
            }
        } else {
            info!("recreating database {}", self.target_database_tmp);
            self.clickhouse_api.database = Some(self.target_database_tmp.clone());
            if !self.is_parallel_worker {
                self.clickhouse_api.recreate_database().await?;
            }
        }

        let tables = self.mysql_api.get_tables().await?;
        self.state.tables = tables
            .into_iter()
            .filter(|table| self.config.is_table_matches(table))
            .collect();
        self.state.last_processed_transaction = self.data_reader.get_last_position()?;
        self.state.last_processed_transaction_non_uploaded =
            self.state.last_processed_transaction.clone();
        self.state.save()?;
        info!(
            "last known transaction: {:?}",
            self.state.last_processed_transaction
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_path_plain() {
        let mut config = Settings::default();
        config.binlog_replicator.data_dir = "/data".to_string();
        let path = DbReplicator::state_path(&config, "shop", None, None);
        assert_eq!(path, PathBuf::from("/data/shop/state.pckl"));
    }

    #[test]
    fn test_state_path_worker() {
        let mut config = Settings::default();
        config.binlog_replicator.data_dir = "/data".to_string();
        let path = DbReplicator::state_path(&config, "shop", Some((2, 4)), Some("orders"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("state_worker_2_of_4_"));
        assert!(name.ends_with(".pckl"));
        // the hash is stable so restarts find the same file
        let again = DbReplicator::state_path(&config, "shop", Some((2, 4)), Some("orders"));
        assert_eq!(path, again);
    }

    #[test]
    fn test_state_path_worker_without_table() {
        let mut config = Settings::default();
        config.binlog_replicator.data_dir = "/data".to_string();
        let path = DbReplicator::state_path(&config, "shop", Some((0, 2)), None);
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "state_worker_0_of_2_all_tables.pckl"
        );
    }
}
