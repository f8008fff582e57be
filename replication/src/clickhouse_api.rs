use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use common::config::ClickhouseSettings;
use common::err::{CResult, ReplError};
use common::schema::TableStructure;

const MAX_RETRIES: u32 = 5;
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Every replicated row carries this implicit version suffix column; the
/// replacing-merge engine keeps the highest version per primary key.
pub const VERSION_COLUMN: &str = "_version";

#[derive(Debug, Default, Clone, Serialize)]
pub struct SingleStats {
    pub duration: f64,
    pub events: u64,
    pub records: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct InsertEraseStats {
    pub inserts: SingleStats,
    pub erases: SingleStats,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GeneralStats {
    pub total: InsertEraseStats,
    pub table_stats: HashMap<String, InsertEraseStats>,
}

impl GeneralStats {
    fn on_event(&mut self, table_name: &str, is_insert: bool, duration: f64, records: u64) {
        let table = self.table_stats.entry(table_name.to_string()).or_default();
        for target in [&mut self.total, table] {
            let single = if is_insert {
                &mut target.inserts
            } else {
                &mut target.erases
            };
            single.duration += duration;
            single.events += 1;
            single.records += records;
        }
    }
}

/// ClickHouse client over the HTTP interface. Statements travel as SQL
/// text, bulk inserts as JSONEachRow bodies; every request carries the
/// `final = 1` setting so reads collapse row versions by default.
pub struct ClickhouseApi {
    pub database: Option<String>,
    settings: ClickhouseSettings,
    client: reqwest::Client,
    base_url: String,
    pub tables_last_record_version: HashMap<String, u64>,
    stats: GeneralStats,
}

impl ClickhouseApi {
    pub fn new(database: Option<&str>, settings: &ClickhouseSettings) -> CResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connection_timeout))
            .timeout(Duration::from_secs(settings.send_receive_timeout))
            .build()?;
        Ok(ClickhouseApi {
            database: database.map(|d| d.to_string()),
            settings: settings.clone(),
            client,
            base_url: format!("http://{}:{}/", settings.host, settings.port),
            tables_last_record_version: HashMap::new(),
            stats: GeneralStats::default(),
        })
    }

    /// Drain the accumulated insert/erase statistics for the periodic log.
    pub fn get_stats(&mut self) -> GeneralStats {
        std::mem::take(&mut self.stats)
    }

    pub fn get_last_used_version(&self, table_name: &str) -> u64 {
        self.tables_last_record_version
            .get(table_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_last_used_version(&mut self, table_name: &str, version: u64) {
        self.tables_last_record_version
            .insert(table_name.to_string(), version);
    }

    async fn raw_request(&self, query: &str, body: Option<String>) -> CResult<String> {
        let mut request = self
            .client
            .post(&self.base_url)
            .header("X-ClickHouse-User", &self.settings.user)
            .header("X-ClickHouse-Key", &self.settings.password)
            .query(&[("final", "1")]);
        if let Some(database) = &self.database {
            request = request.query(&[("database", database.as_str())]);
        }
        let request = match body {
            Some(body) => request.query(&[("query", query)]).body(body),
            None => request.body(query.to_string()),
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }
        if status.is_server_error() {
            // connection-level/server trouble, worth a retry
            return Err(ReplError::TransientTarget(format!(
                "clickhouse returned {}: {}",
                status, text
            )));
        }
        Err(ReplError::Fatal(format!(
            "clickhouse rejected query ({}): {}",
            status, text
        )))
    }

    /// Run a statement with bounded retries on transient errors.
    async fn request_with_retry(&self, query: &str, body: Option<String>) -> CResult<String> {
        let mut attempt = 0;
        loop {
            match self.raw_request(query, body.clone()).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_transient() && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    error!(
                        "error executing query (attempt {}/{}): {}",
                        attempt, MAX_RETRIES, err
                    );
                    sleep(RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn execute_command(&self, query: &str) -> CResult<()> {
        debug!("execute: {}", query);
        self.request_with_retry(query, None).await.map(|_| ())
    }

    pub async fn query_text(&self, query: &str) -> CResult<String> {
        self.request_with_retry(query, None).await
    }

    pub async fn get_databases(&self) -> CResult<Vec<String>> {
        let text = self.query_text("SHOW DATABASES").await?;
        Ok(text.lines().map(|l| l.to_string()).collect())
    }

    pub async fn get_tables(&self) -> CResult<Vec<String>> {
        let text = self.query_text("SHOW TABLES").await?;
        Ok(text.lines().map(|l| l.to_string()).collect())
    }

    pub async fn create_database(&self, db_name: &str) -> CResult<()> {
        self.execute_command(&format!("CREATE DATABASE `{}`", db_name))
            .await
    }

    pub async fn drop_database(&self, db_name: &str) -> CResult<()> {
        self.execute_command(&format!("DROP DATABASE IF EXISTS `{}`", db_name))
            .await
    }

    pub async fn recreate_database(&self) -> CResult<()> {
        let database = self.require_database()?.to_string();
        self.drop_database(&database).await?;
        self.create_database(&database).await
    }

    fn require_database(&self) -> CResult<&str> {
        self.database
            .as_deref()
            .ok_or_else(|| ReplError::Fatal("no target database selected".to_string()))
    }

    /// Highest `_version` stored for a table; used to seed the version
    /// counter after parallel snapshot workers wrote disjoint ranges.
    pub async fn get_max_record_version(&self, table_name: &str) -> CResult<Option<u64>> {
        let database = self.require_database()?;
        let text = self
            .query_text(&format!(
                "SELECT MAX({}) FROM `{}`.`{}`",
                VERSION_COLUMN, database, table_name
            ))
            .await?;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "\\N" || trimmed == "0" {
            return Ok(None);
        }
        Ok(trimmed.parse::<u64>().ok())
    }

    pub fn create_table_query(
        &self,
        structure: &TableStructure,
        additional_indexes: &[String],
        additional_partition_bys: &[String],
    ) -> CResult<String> {
        if structure.primary_keys.is_empty() {
            return Err(ReplError::Fatal(format!(
                "missing primary key for {}",
                structure.table_name
            )));
        }
        let database = self.require_database()?;

        let fields = structure
            .fields
            .iter()
            .map(|field| format!("    `{}` {}", field.name, field.field_type))
            .collect::<Vec<_>>()
            .join(",\n");

        let mut partition_by = String::new();
        if let Some(custom) = additional_partition_bys.first() {
            partition_by = format!("PARTITION BY {}\n", custom);
        } else if structure.primary_keys.len() == 1 {
            let key_field = &structure.fields[structure.primary_key_positions[0]];
            if key_field.field_type.to_lowercase().contains("int") {
                partition_by = format!(
                    "PARTITION BY intDiv({}, 4294967)\n",
                    structure.primary_keys[0]
                );
            }
        }

        let mut indexes = vec![format!(
            "INDEX {} {} TYPE minmax GRANULARITY 1",
            VERSION_COLUMN, VERSION_COLUMN
        )];
        if structure.primary_keys.len() == 1 {
            indexes.push(format!(
                "INDEX idx_id {} TYPE bloom_filter GRANULARITY 1",
                structure.primary_keys[0]
            ));
        }
        indexes.extend(additional_indexes.iter().cloned());
        let indexes = indexes.join(",\n    ");

        let mut primary_key = structure.primary_keys.join(",");
        if structure.primary_keys.len() > 1 {
            primary_key = format!("({})", primary_key);
        }

        Ok(format!(
            "CREATE TABLE {if_not_exists} `{db_name}`.`{table_name}`\n\
             (\n\
             {fields},\n\
             \x20   `{version}` UInt64,\n\
             \x20   {indexes}\n\
             )\n\
             ENGINE = ReplacingMergeTree({version})\n\
             {partition_by}ORDER BY {primary_key}\n\
             SETTINGS index_granularity = 8192",
            if_not_exists = if structure.if_not_exists {
                "IF NOT EXISTS"
            } else {
                ""
            },
            db_name = database,
            table_name = structure.table_name,
            fields = fields,
            version = VERSION_COLUMN,
            indexes = indexes,
            partition_by = partition_by,
            primary_key = primary_key,
        ))
    }

    pub async fn create_table(
        &self,
        structure: &TableStructure,
        additional_indexes: &[String],
        additional_partition_bys: &[String],
    ) -> CResult<()> {
        let query =
            self.create_table_query(structure, additional_indexes, additional_partition_bys)?;
        debug!("create table query: {}", query);
        self.execute_command(&query).await
    }

    /// Bulk insert with monotonic `_version` stamping: rows get versions
    /// `v+1 .. v+len`, and the counter advances only after the write
    /// succeeds.
    pub async fn insert(
        &mut self,
        table_name: &str,
        records: &[Vec<JsonValue>],
        structure: &TableStructure,
    ) -> CResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let database = self.require_database()?.to_string();
        let base_version = self.get_last_used_version(table_name);

        let mut lines = String::new();
        for (offset, record) in records.iter().enumerate() {
            let mut object = serde_json::Map::with_capacity(record.len() + 1);
            for (idx, field) in structure.fields.iter().enumerate() {
                let value = record.get(idx).cloned().unwrap_or(JsonValue::Null);
                object.insert(
                    field.name.clone(),
                    normalize_for_insert(value, &field.field_type),
                );
            }
            object.insert(
                VERSION_COLUMN.to_string(),
                json!(base_version + 1 + offset as u64),
            );
            lines.push_str(&serde_json::to_string(&JsonValue::Object(object))?);
            lines.push('\n');
        }

        let columns = structure
            .fields
            .iter()
            .map(|field| format!("`{}`", field.name))
            .chain(std::iter::once(format!("`{}`", VERSION_COLUMN)))
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "INSERT INTO `{}`.`{}` ({}) FORMAT JSONEachRow",
            database, table_name, columns
        );

        let started = Instant::now();
        self.request_with_retry(&query, Some(lines)).await?;
        self.stats.on_event(
            table_name,
            true,
            started.elapsed().as_secs_f64(),
            records.len() as u64,
        );

        self.set_last_used_version(table_name, base_version + records.len() as u64);
        Ok(())
    }

    /// Delete by primary-key tuples. `field_values` entries are the
    /// pre-rendered key strings produced by the converter.
    pub async fn erase(
        &mut self,
        table_name: &str,
        field_names: &[String],
        field_values: &[String],
    ) -> CResult<()> {
        if field_values.is_empty() {
            return Ok(());
        }
        let database = self.require_database()?.to_string();
        let names = field_names.join(",");
        let values = field_values
            .iter()
            .map(|v| format!("({})", v))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "DELETE FROM `{}`.`{}` WHERE ({}) IN ({})",
            database, table_name, names, values
        );

        let started = Instant::now();
        self.request_with_retry(&query, None).await?;
        self.stats.on_event(
            table_name,
            false,
            started.elapsed().as_secs_f64(),
            field_values.len() as u64,
        );
        Ok(())
    }
}

/// Last-resort fixups before the row leaves the process: a bare date in a
/// datetime column is widened to midnight, and a null in a non-nullable
/// date/datetime column becomes the epoch.
fn normalize_for_insert(value: JsonValue, field_type: &str) -> JsonValue {
    let is_datetime = field_type.contains("DateTime");
    let is_date = field_type.contains("Date32");
    if !is_datetime && !is_date {
        return value;
    }
    match value {
        JsonValue::String(text) => {
            if is_datetime && text.len() == 10 {
                JsonValue::String(format!("{} 00:00:00", text))
            } else {
                JsonValue::String(text)
            }
        }
        JsonValue::Null if !field_type.contains("Nullable") => {
            warn!("null in non-nullable {} column, replaced with epoch", field_type);
            if is_datetime {
                json!("1970-01-01 00:00:00")
            } else {
                json!("1970-01-01")
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use common::schema::TableField;

    use super::*;

    fn api() -> ClickhouseApi {
        ClickhouseApi::new(Some("target"), &ClickhouseSettings::default()).unwrap()
    }

    fn structure(primary_keys: Vec<&str>, fields: Vec<(&str, &str)>) -> TableStructure {
        let mut structure = TableStructure {
            table_name: "t".to_string(),
            primary_keys: primary_keys.iter().map(|k| k.to_string()).collect(),
            if_not_exists: true,
            ..Default::default()
        };
        for (name, field_type) in fields {
            structure.fields.push(TableField::new(name, field_type));
        }
        structure.preprocess().unwrap();
        structure
    }

    #[test]
    fn test_create_table_query_single_int_key() {
        let api = api();
        let structure = structure(
            vec!["id"],
            vec![("id", "Int32"), ("name", "Nullable(String)")],
        );
        let query = api.create_table_query(&structure, &[], &[]).unwrap();
        assert!(query.contains("CREATE TABLE IF NOT EXISTS `target`.`t`"));
        assert!(query.contains("`id` Int32"));
        assert!(query.contains("`_version` UInt64"));
        assert!(query.contains("INDEX _version _version TYPE minmax GRANULARITY 1"));
        assert!(query.contains("INDEX idx_id id TYPE bloom_filter GRANULARITY 1"));
        assert!(query.contains("ENGINE = ReplacingMergeTree(_version)"));
        assert!(query.contains("PARTITION BY intDiv(id, 4294967)"));
        assert!(query.contains("ORDER BY id"));
    }

    #[test]
    fn test_create_table_query_composite_key() {
        let api = api();
        let structure = structure(
            vec!["departments", "termine"],
            vec![("departments", "Int32"), ("termine", "Int32")],
        );
        let query = api.create_table_query(&structure, &[], &[]).unwrap();
        assert!(query.contains("ORDER BY (departments,termine)"));
        // composite keys get neither the bloom filter nor a partition rule
        assert!(!query.contains("bloom_filter"));
        assert!(!query.contains("PARTITION BY"));
    }

    #[test]
    fn test_create_table_query_custom_partition_and_indexes() {
        let api = api();
        let structure = structure(vec!["id"], vec![("id", "Int32")]);
        let query = api
            .create_table_query(
                &structure,
                &["INDEX idx_extra name TYPE set(0) GRANULARITY 1".to_string()],
                &["toYYYYMM(created_at)".to_string()],
            )
            .unwrap();
        assert!(query.contains("PARTITION BY toYYYYMM(created_at)"));
        assert!(!query.contains("intDiv"));
        assert!(query.contains("INDEX idx_extra name TYPE set(0) GRANULARITY 1"));
    }

    #[test]
    fn test_create_table_query_requires_primary_key() {
        let api = api();
        let structure = structure(vec![], vec![("id", "Int32")]);
        assert!(api.create_table_query(&structure, &[], &[]).is_err());
    }

    #[test]
    fn test_normalize_date_widening() {
        assert_eq!(
            normalize_for_insert(json!("2024-05-01"), "DateTime64(3)"),
            json!("2024-05-01 00:00:00")
        );
        assert_eq!(
            normalize_for_insert(json!("2024-05-01"), "Date32"),
            json!("2024-05-01")
        );
        assert_eq!(
            normalize_for_insert(JsonValue::Null, "DateTime64"),
            json!("1970-01-01 00:00:00")
        );
        assert_eq!(
            normalize_for_insert(JsonValue::Null, "Nullable(DateTime64)"),
            JsonValue::Null
        );
        assert_eq!(normalize_for_insert(json!(5), "Int32"), json!(5));
    }

    #[test]
    fn test_version_counter_bookkeeping() {
        let mut api = api();
        assert_eq!(api.get_last_used_version("t"), 0);
        api.set_last_used_version("t", 42);
        assert_eq!(api.get_last_used_version("t"), 42);
    }
}
