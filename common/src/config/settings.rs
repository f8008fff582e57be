use std::collections::HashMap;
use std::fs;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::err::{CResult, ReplError};
use crate::pattern::PatternList;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_OPTIMIZE_INTERVAL: u64 = 86400;
pub const DEFAULT_CHECK_DB_UPDATED_INTERVAL: u64 = 120;
pub const DEFAULT_AUTO_RESTART_INTERVAL: u64 = 3600;
pub const DEFAULT_INITIAL_REPLICATION_BATCH_SIZE: u64 = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MysqlSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for MysqlSettings {
    fn default() -> Self {
        MysqlSettings {
            host: default_host(),
            port: default_mysql_port(),
            user: default_user(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickhouseSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_clickhouse_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// seconds
    #[serde(default = "default_send_receive_timeout")]
    pub send_receive_timeout: u64,
}

impl Default for ClickhouseSettings {
    fn default() -> Self {
        ClickhouseSettings {
            host: default_host(),
            port: default_clickhouse_port(),
            user: default_user(),
            password: String::new(),
            connection_timeout: default_connection_timeout(),
            send_receive_timeout: default_send_receive_timeout(),
        }
    }
}

impl ClickhouseSettings {
    pub fn validate(&self) -> CResult<()> {
        if self.connection_timeout == 0 {
            return Err(ReplError::ConfigError(
                "connection timeout should be at least 1 second".to_string(),
            ));
        }
        if self.send_receive_timeout == 0 {
            return Err(ReplError::ConfigError(
                "send_receive_timeout should be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinlogReplicatorSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_records_per_file")]
    pub records_per_file: u64,
    /// seconds; 12 hours by default
    #[serde(default = "default_binlog_retention_period")]
    pub binlog_retention_period: u64,
}

impl Default for BinlogReplicatorSettings {
    fn default() -> Self {
        BinlogReplicatorSettings {
            data_dir: default_data_dir(),
            records_per_file: default_records_per_file(),
            binlog_retention_period: default_binlog_retention_period(),
        }
    }
}

impl BinlogReplicatorSettings {
    pub fn validate(&self) -> CResult<()> {
        if self.records_per_file == 0 {
            return Err(ReplError::ConfigError(
                "binlog_replicator records_per_file should be positive".to_string(),
            ));
        }
        if self.binlog_retention_period == 0 {
            return Err(ReplError::ConfigError(
                "binlog_replicator binlog_retention_period should be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Extra ClickHouse index added at table creation for matching db/table pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexRule {
    #[serde(default = "default_star_patterns")]
    pub databases: PatternList,
    #[serde(default = "default_star_patterns")]
    pub tables: PatternList,
    pub index: String,
}

/// Partition expression override for matching db/table pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionByRule {
    #[serde(default = "default_star_patterns")]
    pub databases: PatternList,
    #[serde(default = "default_star_patterns")]
    pub tables: PatternList,
    pub partition_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub mysql: MysqlSettings,
    pub clickhouse: ClickhouseSettings,
    pub binlog_replicator: BinlogReplicatorSettings,

    #[serde(default)]
    pub databases: PatternList,
    #[serde(default = "default_star_patterns")]
    pub tables: PatternList,
    #[serde(default)]
    pub exclude_databases: PatternList,
    #[serde(default)]
    pub exclude_tables: PatternList,

    /// source db name -> target db name
    #[serde(default)]
    pub target_databases: HashMap<String, String>,

    /// 0/1 - serial snapshot; >=2 - parallel snapshot worker processes
    #[serde(default)]
    pub initial_replication_threads: u32,
    #[serde(default)]
    pub initial_replication_batch_size: Option<u64>,
    /// suppress delete events and skip the temp-database swap
    #[serde(default)]
    pub ignore_deletes: bool,
    /// IANA zone used to annotate translated timestamp columns
    #[serde(default = "default_mysql_timezone")]
    pub mysql_timezone: String,

    /// user overrides for the source -> target type mapping
    #[serde(default)]
    pub types_mapping: HashMap<String, String>,
    #[serde(default)]
    pub indexes: Vec<IndexRule>,
    #[serde(default)]
    pub partition_bys: Vec<PartitionByRule>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_optimize_interval")]
    pub optimize_interval: u64,
    #[serde(default = "default_auto_restart_interval")]
    pub auto_restart_interval: u64,
    #[serde(default = "default_check_db_updated_interval")]
    pub check_db_updated_interval: u64,

    #[serde(default)]
    pub http_host: String,
    #[serde(default)]
    pub http_port: u16,

    #[serde(skip)]
    pub settings_file: String,
    #[serde(skip)]
    pub debug_log_level: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            mysql: MysqlSettings::default(),
            clickhouse: ClickhouseSettings::default(),
            binlog_replicator: BinlogReplicatorSettings::default(),
            databases: PatternList::default(),
            tables: default_star_patterns(),
            exclude_databases: PatternList::default(),
            exclude_tables: PatternList::default(),
            target_databases: HashMap::new(),
            initial_replication_threads: 0,
            initial_replication_batch_size: None,
            ignore_deletes: false,
            mysql_timezone: default_mysql_timezone(),
            types_mapping: HashMap::new(),
            indexes: Vec::new(),
            partition_bys: Vec::new(),
            log_level: default_log_level(),
            optimize_interval: default_optimize_interval(),
            auto_restart_interval: default_auto_restart_interval(),
            check_db_updated_interval: default_check_db_updated_interval(),
            http_host: String::new(),
            http_port: 0,
            settings_file: String::new(),
            debug_log_level: false,
        }
    }
}

impl Settings {
    pub fn load(settings_file: &str) -> CResult<Settings> {
        let data = fs::read_to_string(settings_file)?;
        let mut settings: Settings = serde_yaml::from_str(&data)?;
        settings.settings_file = settings_file.to_string();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&mut self) -> CResult<()> {
        self.clickhouse.validate()?;
        self.binlog_replicator.validate()?;
        self.validate_log_level()?;
        self.validate_mysql_timezone()?;
        Ok(())
    }

    fn validate_log_level(&mut self) -> CResult<()> {
        match self.log_level.as_str() {
            "critical" | "error" | "warning" | "info" => {}
            "debug" => self.debug_log_level = true,
            other => {
                return Err(ReplError::ConfigError(format!(
                    "wrong log level {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn validate_mysql_timezone(&self) -> CResult<()> {
        chrono_tz::Tz::from_str(&self.mysql_timezone).map_err(|_| {
            ReplError::ConfigError(format!(
                "invalid timezone: {}. Use IANA timezone names like \"UTC\", \
                 \"Europe/London\", \"America/New_York\"",
                self.mysql_timezone
            ))
        })?;
        Ok(())
    }

    pub fn is_database_matches(&self, db_name: &str) -> bool {
        if self.exclude_databases.matches_for_exclude(db_name) {
            return false;
        }
        self.databases.matches(db_name)
    }

    pub fn is_table_matches(&self, table_name: &str) -> bool {
        if self.exclude_tables.matches_for_exclude(table_name) {
            return false;
        }
        self.tables.matches(table_name)
    }

    pub fn get_indexes(&self, db_name: &str, table_name: &str) -> Vec<String> {
        self.indexes
            .iter()
            .filter(|rule| rule.databases.matches(db_name) && rule.tables.matches(table_name))
            .map(|rule| rule.index.clone())
            .collect()
    }

    pub fn get_partition_bys(&self, db_name: &str, table_name: &str) -> Vec<String> {
        self.partition_bys
            .iter()
            .filter(|rule| rule.databases.matches(db_name) && rule.tables.matches(table_name))
            .map(|rule| rule.partition_by.clone())
            .collect()
    }

    /// Resolve the target database name for a source database.
    pub fn target_database(&self, db_name: &str) -> String {
        self.target_databases
            .get(db_name)
            .cloned()
            .unwrap_or_else(|| db_name.to_string())
    }

    pub fn initial_replication_batch_size(&self) -> u64 {
        self.initial_replication_batch_size
            .unwrap_or(DEFAULT_INITIAL_REPLICATION_BATCH_SIZE)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_clickhouse_port() -> u16 {
    8123
}

fn default_user() -> String {
    "root".to_string()
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_send_receive_timeout() -> u64 {
    120
}

fn default_data_dir() -> String {
    "binlog".to_string()
}

fn default_records_per_file() -> u64 {
    100_000
}

fn default_binlog_retention_period() -> u64 {
    43200
}

fn default_star_patterns() -> PatternList {
    PatternList::Single("*".to_string())
}

fn default_mysql_timezone() -> String {
    "UTC".to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_optimize_interval() -> u64 {
    DEFAULT_OPTIMIZE_INTERVAL
}

fn default_auto_restart_interval() -> u64 {
    DEFAULT_AUTO_RESTART_INTERVAL
}

fn default_check_db_updated_interval() -> u64 {
    DEFAULT_CHECK_DB_UPDATED_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mysql:
  host: localhost
  port: 3306
  user: root
  password: admin

clickhouse:
  host: localhost
  port: 9123
  user: default
  password: admin

binlog_replicator:
  data_dir: /app/binlog/
  records_per_file: 100000
  binlog_retention_period: 43200

databases: 'test_db_*'
tables: '*'
log_level: 'debug'
"#;

    #[test]
    fn test_load_sample() {
        let mut settings: Settings = serde_yaml::from_str(SAMPLE).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.clickhouse.port, 9123);
        assert!(settings.debug_log_level);
        assert!(settings.is_database_matches("test_db_1"));
        assert!(!settings.is_database_matches("production"));
        assert!(settings.is_table_matches("anything"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let data = format!("{}\nunknown_option: 1\n", SAMPLE);
        assert!(serde_yaml::from_str::<Settings>(&data).is_err());
    }

    #[test]
    fn test_database_list_patterns() {
        let data = SAMPLE.replace("databases: 'test_db_*'", "databases: ['db1', 'db2_*']");
        let settings: Settings = serde_yaml::from_str(&data).unwrap();
        assert!(settings.is_database_matches("db1"));
        assert!(settings.is_database_matches("db2_x"));
        assert!(!settings.is_database_matches("db3"));
    }

    #[test]
    fn test_bad_log_level() {
        let data = SAMPLE.replace("log_level: 'debug'", "log_level: 'verbose'");
        let mut settings: Settings = serde_yaml::from_str(&data).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bad_timezone() {
        let data = format!("{}\nmysql_timezone: 'Mars/Olympus'\n", SAMPLE);
        let mut settings: Settings = serde_yaml::from_str(&data).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_exclude_takes_precedence() {
        let data = format!("{}\nexclude_databases: 'test_db_2'\n", SAMPLE);
        let settings: Settings = serde_yaml::from_str(&data).unwrap();
        assert!(settings.is_database_matches("test_db_1"));
        assert!(!settings.is_database_matches("test_db_2"));
    }
}
