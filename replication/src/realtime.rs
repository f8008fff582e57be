use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::err::{CResult, ReplError};
use common::event::{BinlogPosition, EventKind, LogEvent};
use common::utils::GracefulKiller;

use crate::converter::{record_id, strip_sql_comments};
use crate::db_replicator::DbReplicator;
use crate::state::Status;

const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(10);
const STATS_DUMP_INTERVAL: Duration = Duration::from_secs(60);
const DATA_DUMP_INTERVAL: Duration = Duration::from_secs(1);
const DATA_DUMP_BATCH_SIZE: usize = 100_000;
const READ_LOG_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Default, Serialize)]
struct Statistics {
    last_transaction: Option<BinlogPosition>,
    events_count: u64,
    insert_events_count: u64,
    insert_records_count: u64,
    erase_events_count: u64,
    erase_records_count: u64,
    no_events_count: u64,
}

/// Realtime applier: tails the event log from the last durable position,
/// buffers row changes per table and flushes them in batches; DDL is applied
/// only after a full flush so rows always land under the schema they were
/// produced with.
pub struct DbReplicatorRealtime<'a> {
    repl: &'a mut DbReplicator,
    /// table -> primary-key string -> converted row (latest image wins)
    records_to_insert: HashMap<String, HashMap<String, Vec<JsonValue>>>,
    /// table -> primary-key strings
    records_to_delete: HashMap<String, HashSet<String>>,
    last_save_state_time: Option<Instant>,
    last_dump_stats_time: Instant,
    last_records_upload_time: Instant,
    start_time: Instant,
    stats: Statistics,
}

impl<'a> DbReplicatorRealtime<'a> {
    pub fn new(repl: &'a mut DbReplicator) -> Self {
        DbReplicatorRealtime {
            repl,
            records_to_insert: HashMap::new(),
            records_to_delete: HashMap::new(),
            last_save_state_time: None,
            last_dump_stats_time: Instant::now(),
            last_records_upload_time: Instant::now(),
            start_time: Instant::now(),
            stats: Statistics::default(),
        }
    }

    pub async fn run(&mut self) -> CResult<()> {
        if self.repl.initial_only {
            info!("skip running realtime replication, only initial replication was requested");
            self.repl.state.remove()?;
            return Ok(());
        }

        // the source connection is only needed by the snapshot
        self.repl.mysql_api.close().await;

        info!(
            "running realtime replication from position: {:?}",
            self.repl.state.last_processed_transaction
        );
        self.repl.state.status = Status::RunningRealtimeReplication;
        self.repl.state.save()?;
        self.repl
            .data_reader
            .set_position(self.repl.state.last_processed_transaction.as_ref())?;

        let killer = GracefulKiller::install();

        while !killer.kill_now() {
            if self.repl.config.auto_restart_interval > 0
                && self.start_time.elapsed()
                    >= Duration::from_secs(self.repl.config.auto_restart_interval)
            {
                info!("process restart (check auto_restart_interval config option)");
                break;
            }

            let event = match self.repl.data_reader.read_next_event()? {
                Some(event) => event,
                None => {
                    sleep(READ_LOG_INTERVAL).await;
                    self.upload_records_if_required(None).await?;
                    self.stats.no_events_count += 1;
                    self.log_stats_if_required();
                    continue;
                }
            };
            self.handle_event(event).await?;
        }

        info!("stopping db_replicator");
        self.upload_records().await?;
        self.save_state_if_required(true)?;
        info!("stopped");
        Ok(())
    }

    async fn handle_event(&mut self, mut event: LogEvent) -> CResult<()> {
        // deduplication across the binlog reader's one-step rewind
        if let Some(non_uploaded) = &self.repl.state.last_processed_transaction_non_uploaded {
            if &event.position <= non_uploaded {
                return Ok(());
            }
        }

        debug!(
            "processing event {}, {:?}, {}",
            event.position, event.kind, event.table_name
        );

        // events carry the source database name; DDL handlers work against
        // the target one
        if event.db_name == self.repl.database {
            event.db_name = self.repl.target_database.clone();
        }

        let table_matches = event.table_name.is_empty()
            || self.repl.config.is_table_matches(&event.table_name);
        if table_matches {
            match event.kind {
                EventKind::Insert => self.handle_insert_event(&event)?,
                EventKind::Delete => self.handle_erase_event(&event)?,
                EventKind::Query => self.handle_query_event(&event).await?,
            }
        }

        self.stats.events_count += 1;
        self.stats.last_transaction = Some(event.position.clone());
        self.repl.state.last_processed_transaction_non_uploaded = Some(event.position);

        let table_name = event.table_name.clone();
        self.upload_records_if_required(Some(&table_name)).await?;
        self.save_state_if_required(false)?;
        self.log_stats_if_required();
        Ok(())
    }

    fn handle_insert_event(&mut self, event: &LogEvent) -> CResult<()> {
        self.stats.insert_events_count += 1;
        self.stats.insert_records_count += event.rows.len() as u64;

        let (mysql_structure, clickhouse_structure) = self
            .repl
            .state
            .tables_structure
            .get(&event.table_name)
            .ok_or_else(|| {
                ReplError::Fatal(format!("no structure for table {}", event.table_name))
            })?;
        let records = self.repl.converter.convert_records(
            &event.rows,
            mysql_structure,
            clickhouse_structure,
            false,
        )?;

        let inserts = self
            .records_to_insert
            .entry(event.table_name.clone())
            .or_default();
        let deletes = self
            .records_to_delete
            .entry(event.table_name.clone())
            .or_default();
        let clickhouse_structure = &self.repl.state.tables_structure[&event.table_name].1;
        for record in records {
            let key = record_id(clickhouse_structure, &record);
            deletes.remove(&key);
            inserts.insert(key, record);
        }
        Ok(())
    }

    fn handle_erase_event(&mut self, event: &LogEvent) -> CResult<()> {
        if self.repl.config.ignore_deletes {
            return Ok(());
        }
        self.stats.erase_events_count += 1;
        self.stats.erase_records_count += event.rows.len() as u64;

        let (mysql_structure, clickhouse_structure) = self
            .repl
            .state
            .tables_structure
            .get(&event.table_name)
            .ok_or_else(|| {
                ReplError::Fatal(format!("no structure for table {}", event.table_name))
            })?;
        let records = self.repl.converter.convert_records(
            &event.rows,
            mysql_structure,
            clickhouse_structure,
            true,
        )?;
        let keys: Vec<String> = records
            .iter()
            .map(|record| record_id(clickhouse_structure, record))
            .collect();

        let inserts = self
            .records_to_insert
            .entry(event.table_name.clone())
            .or_default();
        let deletes = self
            .records_to_delete
            .entry(event.table_name.clone())
            .or_default();
        for key in keys {
            inserts.remove(&key);
            deletes.insert(key);
        }
        Ok(())
    }

    /// Pending buffers are flushed before any DDL so that buffered rows are
    /// written under the schema they were produced with.
    async fn handle_query_event(&mut self, event: &LogEvent) -> CResult<()> {
        debug!("processing query event: {}", event.query);
        let query = strip_sql_comments(&event.query);
        let lower = query.to_lowercase();

        if lower.starts_with("alter") {
            self.upload_records().await?;
            self.handle_alter_query(&query, &event.db_name).await?;
        } else if lower.starts_with("create table") {
            self.upload_records().await?;
            self.handle_create_table_query(&query).await?;
        } else if lower.starts_with("drop table") {
            self.upload_records().await?;
            self.handle_drop_table_query(&query, &event.db_name).await?;
        } else if lower.starts_with("rename table") {
            self.upload_records().await?;
            self.handle_rename_table_query(&query, &event.db_name).await?;
        } else if lower.starts_with("truncate") {
            self.upload_records().await?;
            self.handle_truncate_query(&query, &event.db_name).await?;
        }
        Ok(())
    }

    async fn handle_alter_query(&mut self, query: &str, db_name: &str) -> CResult<()> {
        let statements = self.repl.converter.convert_alter_query(
            query,
            db_name,
            &mut self.repl.state.tables_structure,
        )?;
        for statement in statements {
            self.repl.clickhouse_api.execute_command(&statement).await?;
        }
        Ok(())
    }

    async fn handle_create_table_query(&mut self, query: &str) -> CResult<()> {
        let (mysql_structure, clickhouse_structure) = self
            .repl
            .converter
            .parse_create_table_query(query, &self.repl.state.tables_structure)?;
        if !self.repl.config.is_table_matches(&mysql_structure.table_name) {
            return Ok(());
        }
        let indexes = self
            .repl
            .config
            .get_indexes(&self.repl.database, &clickhouse_structure.table_name);
        let partition_bys = self
            .repl
            .config
            .get_partition_bys(&self.repl.database, &clickhouse_structure.table_name);
        self.repl.state.tables_structure.insert(
            mysql_structure.table_name.clone(),
            (mysql_structure, clickhouse_structure.clone()),
        );
        self.repl
            .clickhouse_api
            .create_table(&clickhouse_structure, &indexes, &partition_bys)
            .await
    }

    async fn handle_drop_table_query(&mut self, query: &str, db_name: &str) -> CResult<()> {
        let mut tokens: Vec<&str> = query.split_whitespace().collect();
        if tokens.len() < 3
            || !tokens[0].eq_ignore_ascii_case("drop")
            || !tokens[1].eq_ignore_ascii_case("table")
        {
            return Err(ReplError::ParseError(format!(
                "wrong drop table query: {}",
                query
            )));
        }
        let if_exists = tokens.len() > 4
            && tokens[2].eq_ignore_ascii_case("if")
            && tokens[3].eq_ignore_ascii_case("exists");
        if if_exists {
            tokens.drain(2..4);
        }
        if tokens.len() != 3 {
            return Err(ReplError::ParseError(format!(
                "wrong token count: {}",
                query
            )));
        }

        let (db_name, table_name, matches) =
            self.repl.converter.get_db_and_table_name(tokens[2], db_name);
        if !matches {
            return Ok(());
        }
        self.repl.state.tables_structure.remove(&table_name);
        self.repl
            .clickhouse_api
            .execute_command(&format!(
                "DROP TABLE {} `{}`.`{}`",
                if if_exists { "IF EXISTS" } else { "" },
                db_name,
                table_name
            ))
            .await
    }

    async fn handle_rename_table_query(&mut self, query: &str, db_name: &str) -> CResult<()> {
        let tokens: Vec<&str> = query.split_whitespace().collect();
        if tokens.len() < 3
            || !tokens[0].eq_ignore_ascii_case("rename")
            || !tokens[1].eq_ignore_ascii_case("table")
        {
            return Err(ReplError::ParseError(format!(
                "wrong rename table query: {}",
                query
            )));
        }

        let mut ch_clauses = Vec::new();
        for rename_clause in tokens[2..].join(" ").split(',') {
            let clause_tokens: Vec<&str> = rename_clause.split_whitespace().collect();
            if clause_tokens.len() != 3 {
                return Err(ReplError::ParseError(format!(
                    "wrong token count: {}",
                    query
                )));
            }
            if !clause_tokens[1].eq_ignore_ascii_case("to") {
                return Err(ReplError::ParseError(format!(
                    "\"to\" keyword expected: {}",
                    query
                )));
            }

            let (src_db_name, src_table_name, matches) = self
                .repl
                .converter
                .get_db_and_table_name(clause_tokens[0], db_name);
            let (dest_db_name, dest_table_name, _) = self
                .repl
                .converter
                .get_db_and_table_name(clause_tokens[2], db_name);
            if !matches {
                return Ok(());
            }
            if src_db_name != self.repl.target_database
                || dest_db_name != self.repl.target_database
            {
                return Err(ReplError::Fatal(format!(
                    "cross database table renames not implemented: {}",
                    query
                )));
            }
            if let Some(structures) = self.repl.state.tables_structure.remove(&src_table_name)
            {
                self.repl
                    .state
                    .tables_structure
                    .insert(dest_table_name.clone(), structures);
            }
            ch_clauses.push(format!(
                "`{}`.`{}` TO `{}`.`{}`",
                src_db_name, src_table_name, dest_db_name, dest_table_name
            ));
        }
        self.repl
            .clickhouse_api
            .execute_command(&format!("RENAME TABLE {}", ch_clauses.join(", ")))
            .await
    }

    async fn handle_truncate_query(&mut self, query: &str, db_name: &str) -> CResult<()> {
        let tokens: Vec<&str> = query.split_whitespace().collect();
        if tokens.len() < 2 || !tokens[0].eq_ignore_ascii_case("truncate") {
            return Err(ReplError::ParseError(format!(
                "wrong truncate query: {}",
                query
            )));
        }
        // the TABLE keyword is optional
        let table_token = if tokens[1].eq_ignore_ascii_case("table") {
            *tokens.get(2).ok_or_else(|| {
                ReplError::ParseError(format!("wrong truncate query: {}", query))
            })?
        } else {
            tokens[1]
        };

        let (db_name, table_name, matches) =
            self.repl.converter.get_db_and_table_name(table_token, db_name);
        if !matches {
            return Ok(());
        }
        if !self.repl.state.tables_structure.contains_key(&table_name) {
            warn!("truncate: table {} not tracked, skipping", table_name);
            return Ok(());
        }

        // rows buffered before the truncate must never surface after it
        if let Some(pending) = self.records_to_insert.get_mut(&table_name) {
            pending.clear();
        }
        if let Some(pending) = self.records_to_delete.get_mut(&table_name) {
            pending.clear();
        }

        info!("executing truncate on {}.{}", db_name, table_name);
        self.repl
            .clickhouse_api
            .execute_command(&format!("TRUNCATE TABLE `{}`.`{}`", db_name, table_name))
            .await
    }

    fn save_state_if_required(&mut self, force: bool) -> CResult<()> {
        if !force {
            if let Some(at) = self.last_save_state_time {
                if at.elapsed() < SAVE_STATE_INTERVAL {
                    return Ok(());
                }
            }
        }
        self.last_save_state_time = Some(Instant::now());
        self.repl.state.tables_last_record_version = self
            .repl
            .clickhouse_api
            .tables_last_record_version
            .clone();
        self.repl.state.save()
    }

    fn log_stats_if_required(&mut self) {
        if self.last_dump_stats_time.elapsed() < STATS_DUMP_INTERVAL {
            return;
        }
        self.last_dump_stats_time = Instant::now();
        let stats = std::mem::take(&mut self.stats);
        let ch_stats = self.repl.clickhouse_api.get_stats();
        info!(
            "stats: {}",
            serde_json::to_string(&stats).unwrap_or_default()
        );
        info!(
            "ch_stats: {}",
            serde_json::to_string(&ch_stats).unwrap_or_default()
        );
    }

    async fn upload_records_if_required(&mut self, table_name: Option<&str>) -> CResult<()> {
        let mut need_dump = false;
        if let Some(table_name) = table_name {
            if self
                .records_to_insert
                .get(table_name)
                .map(|m| m.len() >= DATA_DUMP_BATCH_SIZE)
                .unwrap_or(false)
                || self
                    .records_to_delete
                    .get(table_name)
                    .map(|s| s.len() >= DATA_DUMP_BATCH_SIZE)
                    .unwrap_or(false)
            {
                need_dump = true;
            }
        }
        if self.last_records_upload_time.elapsed() >= DATA_DUMP_INTERVAL {
            need_dump = true;
        }
        if !need_dump {
            return Ok(());
        }
        self.upload_records().await
    }

    /// Flush: inserts first, then deletes, then the durable position
    /// catches up with the consumed one.
    async fn upload_records(&mut self) -> CResult<()> {
        debug!(
            "upload records, tables to insert: {}, to delete: {}",
            self.records_to_insert.len(),
            self.records_to_delete.len()
        );
        self.last_records_upload_time = Instant::now();

        let inserts = std::mem::take(&mut self.records_to_insert);
        for (table_name, keyed_records) in inserts {
            if keyed_records.is_empty() {
                continue;
            }
            let clickhouse_structure = self
                .repl
                .state
                .tables_structure
                .get(&table_name)
                .map(|(_, ch)| ch.clone())
                .ok_or_else(|| {
                    ReplError::Fatal(format!("no structure for table {}", table_name))
                })?;
            let records: Vec<Vec<JsonValue>> = keyed_records.into_values().collect();
            self.repl
                .clickhouse_api
                .insert(&table_name, &records, &clickhouse_structure)
                .await?;
        }

        let deletes = std::mem::take(&mut self.records_to_delete);
        for (table_name, keys) in deletes {
            if keys.is_empty() {
                continue;
            }
            let primary_keys = self
                .repl
                .state
                .tables_structure
                .get(&table_name)
                .map(|(mysql, _)| mysql.primary_keys.clone())
                .ok_or_else(|| {
                    ReplError::Fatal(format!("no structure for table {}", table_name))
                })?;
            let keys: Vec<String> = keys.into_iter().collect();
            self.repl
                .clickhouse_api
                .erase(&table_name, &primary_keys, &keys)
                .await?;
        }

        self.repl.state.last_processed_transaction = self
            .repl
            .state
            .last_processed_transaction_non_uploaded
            .clone();
        self.save_state_if_required(false)
    }
}
