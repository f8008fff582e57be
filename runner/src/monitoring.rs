use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::sleep;
use tracing::warn;

use common::config::Settings;
use common::err::{CResult, ReplError};
use common::utils::GracefulKiller;
use event_log::state::BinlogState;
use replication::mysql_api::MySQLApi;
use replication::state::DbState;

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Numeric suffix of a binlog file name (`mysql-bin.000042` -> 42).
fn bnum(file_name: &str) -> i64 {
    file_name
        .rsplit('.')
        .next()
        .and_then(|suffix| suffix.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Lag report: prints a pipe-separated line per interval with the MySQL
/// binlog tail, the reader position and every watched database's processed
/// position, with file-number differences as the lag measure.
pub struct Monitoring {
    config: Settings,
    databases: Vec<String>,
    mysql_api: MySQLApi,
}

impl Monitoring {
    pub fn new(databases: &str, config: Settings) -> Self {
        let databases = databases
            .split(',')
            .map(|db| db.trim().to_string())
            .filter(|db| !db.is_empty())
            .collect();
        let mysql_api = MySQLApi::new(None, &config.mysql);
        Monitoring {
            config,
            databases,
            mysql_api,
        }
    }

    fn get_binlog_reader_position(&self) -> CResult<String> {
        let path = PathBuf::from(&self.config.binlog_replicator.data_dir).join("state.json");
        let state = BinlogState::load(&path)?;
        state
            .last_seen_transaction
            .map(|position| position.file)
            .ok_or_else(|| ReplError::String("no binlog reader position yet".to_string()))
    }

    fn get_database_position(&self, database: &str) -> CResult<String> {
        let path = PathBuf::from(&self.config.binlog_replicator.data_dir)
            .join(database)
            .join("state.pckl");
        let state = DbState::load(&path)?;
        state
            .last_processed_transaction
            .map(|position| position.file)
            .ok_or_else(|| ReplError::String(format!("no position for {}", database)))
    }

    async fn get_last_binlog_mysql(&mut self) -> CResult<String> {
        let mut files = self.mysql_api.get_binlog_files().await?;
        files.sort();
        files
            .pop()
            .ok_or_else(|| ReplError::TransientSource("no binlog files on source".to_string()))
    }

    pub async fn run(&mut self) -> CResult<()> {
        let mut header = vec![
            "timestamp".to_string(),
            "mysql".to_string(),
            "binlog".to_string(),
            "binlog_diff".to_string(),
        ];
        for database in &self.databases {
            header.push(database.clone());
            header.push(format!("{}_diff", database));
        }
        println!("{}", header.join("|"));

        let killer = GracefulKiller::install();
        while !killer.kill_now() {
            match self.report_line().await {
                Ok(line) => println!("{}", line),
                Err(err) => warn!("monitoring: {}", err),
            }
            sleep(CHECK_INTERVAL).await;
        }
        Ok(())
    }

    async fn report_line(&mut self) -> CResult<String> {
        let binlog_file_mysql = self.get_last_binlog_mysql().await?;
        let binlog_file_reader = self.get_binlog_reader_position()?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut stats = vec![
            timestamp.to_string(),
            binlog_file_mysql.clone(),
            binlog_file_reader.clone(),
            (bnum(&binlog_file_mysql) - bnum(&binlog_file_reader)).to_string(),
        ];

        let databases = self.databases.clone();
        for database in &databases {
            let database_position = self.get_database_position(database)?;
            stats.push(database_position.clone());
            stats.push((bnum(&binlog_file_mysql) - bnum(&database_position)).to_string());
        }
        Ok(stats.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bnum() {
        assert_eq!(bnum("mysql-bin.000042"), 42);
        assert_eq!(bnum("garbage"), 0);
    }
}
