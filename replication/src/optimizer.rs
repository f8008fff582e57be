use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info};

use common::config::Settings;
use common::err::CResult;
use common::utils::{write_atomic, GracefulKiller};

use crate::clickhouse_api::ClickhouseApi;
use crate::mysql_api::MySQLApi;

const IDLE_SLEEP_CAP: Duration = Duration::from_secs(120);

/// Durable record of when each database was last optimized
/// (`<data_dir>/db_optimizer.bin`).
#[derive(Debug, Default, Serialize, Deserialize)]
struct OptimizerState {
    #[serde(skip)]
    file_name: PathBuf,
    last_process_time: HashMap<String, u64>,
}

impl OptimizerState {
    fn load(file_name: &Path) -> CResult<Self> {
        let mut state: OptimizerState = if file_name.exists() {
            bincode::deserialize(&fs::read(file_name)?)?
        } else {
            OptimizerState::default()
        };
        state.file_name = file_name.to_path_buf();
        Ok(state)
    }

    fn save(&self) -> CResult<()> {
        write_atomic(&self.file_name, &bincode::serialize(self)?)
    }
}

/// Periodically issues `OPTIMIZE TABLE ... FINAL` so the replacing-merge
/// engine collapses row versions without waiting for background merges.
pub struct DbOptimizer {
    config: Settings,
    state: OptimizerState,
    mysql_api: MySQLApi,
    clickhouse_api: ClickhouseApi,
}

impl DbOptimizer {
    pub fn new(config: Settings) -> CResult<Self> {
        let state_path =
            PathBuf::from(&config.binlog_replicator.data_dir).join("db_optimizer.bin");
        let mysql_api = MySQLApi::new(None, &config.mysql);
        let clickhouse_api = ClickhouseApi::new(None, &config.clickhouse)?;
        Ok(DbOptimizer {
            state: OptimizerState::load(&state_path)?,
            config,
            mysql_api,
            clickhouse_api,
        })
    }

    fn now_seconds() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    async fn select_db_to_optimize(&mut self) -> CResult<Option<String>> {
        let databases = self.mysql_api.get_databases().await?;
        let clickhouse_databases: Vec<String> = self.clickhouse_api.get_databases().await?;

        for db in databases {
            if !self.config.is_database_matches(&db) {
                continue;
            }
            if !clickhouse_databases.contains(&db)
                && !clickhouse_databases.contains(&self.config.target_database(&db))
            {
                continue;
            }
            let last = self.state.last_process_time.get(&db).copied().unwrap_or(0);
            if Self::now_seconds().saturating_sub(last) < self.config.optimize_interval {
                continue;
            }
            return Ok(Some(db));
        }
        Ok(None)
    }

    async fn optimize_table(&mut self, db_name: &str, table_name: &str) -> CResult<()> {
        info!("optimizing table {}.{}", db_name, table_name);
        let started = Instant::now();
        self.clickhouse_api
            .execute_command(&format!(
                "OPTIMIZE TABLE `{}`.`{}` FINAL SETTINGS mutations_sync = 2",
                db_name, table_name
            ))
            .await?;
        info!("optimize finished in {:?}", started.elapsed());
        Ok(())
    }

    async fn optimize_database(&mut self, db_name: &str) -> CResult<()> {
        self.mysql_api.set_database(db_name).await?;
        let tables = self.mysql_api.get_tables().await?;
        self.mysql_api.close().await;

        let target_db = self.config.target_database(db_name);
        self.clickhouse_api.database = Some(target_db.clone());
        let ch_tables = self.clickhouse_api.get_tables().await?;

        for table in tables {
            if !self.config.is_table_matches(&table) {
                continue;
            }
            if !ch_tables.contains(&table) {
                continue;
            }
            self.optimize_table(&target_db, &table).await?;
        }
        self.state
            .last_process_time
            .insert(db_name.to_string(), Self::now_seconds());
        self.state.save()?;
        Ok(())
    }

    pub async fn run(&mut self) -> CResult<()> {
        info!("running optimizer");
        let killer = GracefulKiller::install();

        while !killer.kill_now() {
            let db_to_optimize = match self.select_db_to_optimize().await {
                Ok(db) => db,
                Err(err) => {
                    error!("error selecting database to optimize: {}", err);
                    sleep(IDLE_SLEEP_CAP).await;
                    continue;
                }
            };
            self.mysql_api.close().await;
            match db_to_optimize {
                Some(db) => {
                    if let Err(err) = self.optimize_database(&db).await {
                        error!("error optimizing {}: {}", db, err);
                        sleep(IDLE_SLEEP_CAP).await;
                    }
                }
                None => {
                    let idle =
                        IDLE_SLEEP_CAP.min(Duration::from_secs(self.config.optimize_interval.max(1)));
                    sleep(idle).await;
                }
            }
        }
        info!("optimizer stopped");
        Ok(())
    }
}
