use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use common::err::{CResult, ReplError};
use common::event::ColumnValue;
use common::schema::TableStructure;
use common::utils::touch_all_files;

use crate::converter::compare_values;
use crate::db_replicator::DbReplicator;
use crate::state::Status;

const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(10);
const BINLOG_TOUCH_INTERVAL: Duration = Duration::from_secs(120);
const STATS_DUMP_INTERVAL: Duration = Duration::from_secs(60);
/// Wall-clock bound on one table's parallel snapshot.
const PARALLEL_TABLE_TIMEOUT: Duration = Duration::from_secs(3600);
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Initial snapshot: builds target structures, then copies every selected
/// table with keyset pagination (optionally across parallel worker
/// processes) and finally swaps the temporary database in.
pub struct DbReplicatorInitial<'a> {
    repl: &'a mut DbReplicator,
    last_touch_time: Option<Instant>,
    last_save_state_time: Option<Instant>,
}

impl<'a> DbReplicatorInitial<'a> {
    pub fn new(repl: &'a mut DbReplicator) -> Self {
        DbReplicatorInitial {
            repl,
            last_touch_time: None,
            last_save_state_time: None,
        }
    }

    pub async fn create_initial_structure(&mut self) -> CResult<()> {
        info!(
            "status change: {:?} -> {:?}",
            self.repl.state.status,
            Status::CreatingInitialStructures
        );
        self.repl.state.status = Status::CreatingInitialStructures;
        let tables = self.repl.state.tables.clone();
        for table in tables {
            self.create_initial_structure_table(&table).await?;
        }
        self.repl.state.save()?;
        Ok(())
    }

    async fn create_initial_structure_table(&mut self, table_name: &str) -> CResult<()> {
        if !self.repl.config.is_table_matches(table_name) {
            return Ok(());
        }
        if let Some(single_table) = &self.repl.single_table {
            if single_table != table_name {
                return Ok(());
            }
        }

        let create_statement = self
            .repl
            .mysql_api
            .get_table_create_statement(table_name)
            .await?;
        let mysql_structure = self
            .repl
            .converter
            .parse_mysql_table_structure(&create_statement)?;
        validate_mysql_structure(&mysql_structure);
        let mut clickhouse_structure =
            self.repl.converter.convert_table_structure(&mysql_structure)?;
        // tolerate re-runs after a crash between create and state save
        clickhouse_structure.if_not_exists = true;

        let indexes = self
            .repl
            .config
            .get_indexes(&self.repl.database, table_name);
        let partition_bys = self
            .repl
            .config
            .get_partition_bys(&self.repl.database, table_name);

        if !self.repl.is_parallel_worker {
            self.repl
                .clickhouse_api
                .create_table(&clickhouse_structure, &indexes, &partition_bys)
                .await?;
        }
        self.repl.state.tables_structure.insert(
            table_name.to_string(),
            (mysql_structure, clickhouse_structure),
        );
        Ok(())
    }

    fn prevent_binlog_removal(&mut self) -> CResult<()> {
        if let Some(at) = self.last_touch_time {
            if at.elapsed() < BINLOG_TOUCH_INTERVAL {
                return Ok(());
            }
        }
        let binlog_directory = PathBuf::from(&self.repl.config.binlog_replicator.data_dir)
            .join(&self.repl.database);
        if !binlog_directory.exists() {
            return Ok(());
        }
        info!("touch binlog {:?}", binlog_directory);
        self.last_touch_time = Some(Instant::now());
        touch_all_files(&binlog_directory)
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

    pub async fn perform_initial_replication(&mut self) -> CResult<()> {
        self.repl.clickhouse_api.database = Some(self.repl.target_database_tmp.clone());
        info!("running initial replication");
        info!(
            "status change: {:?} -> {:?}",
            self.repl.state.status,
            Status::PerformingInitialReplication
        );
        self.repl.state.status = Status::PerformingInitialReplication;
        self.repl.state.save()?;

        let mut start_table = self.repl.state.initial_replication_table.clone();
        let mut failed_tables: Vec<(String, String)> = Vec::new();

        let tables = self.repl.state.tables.clone();
        info!(
            "initial replication: {} tables, resuming from {:?}",
            tables.len(),
            start_table
        );
        for table in &tables {
            if let Some(start) = &start_table {
                if start != table {
                    // everything before the resume point is already done
                    continue;
                }
            }
            if let Some(single_table) = &self.repl.single_table {
                if single_table != table {
                    continue;
                }
            }

            match self.perform_initial_replication_table(table).await {
                Ok(()) => {
                    info!("table {} done", table);
                }
                Err(ReplError::ShutdownRequested) => {
                    return Err(ReplError::ShutdownRequested)
                }
                Err(err) => {
                    error!("table {} failed: {}, continuing to next table", table, err);
                    failed_tables.push((table.clone(), err.to_string()));
                }
            }
            start_table = None;
        }

        if !self.repl.is_parallel_worker {
            self.verify_table_structures_after_replication().await?;

            if !self.repl.config.ignore_deletes {
                self.swap_database().await?;
            }
            self.repl.clickhouse_api.database = Some(self.repl.target_database.clone());
        }

        if !failed_tables.is_empty() {
            let names: Vec<&str> = failed_tables.iter().map(|(t, _)| t.as_str()).collect();
            for (table, err) in &failed_tables {
                error!("  - {}: {}", table, err);
            }
            return Err(ReplError::Fatal(format!(
                "initial replication failed for {} tables: {}",
                failed_tables.len(),
                names.join(", ")
            )));
        }

        // clear the resume cursor on success
        self.repl.state.initial_replication_table = None;
        self.repl.state.initial_replication_max_primary_key = None;
        self.repl.state.save()?;
        info!("initial replication - done");
        Ok(())
    }

    /// `RENAME d -> d_old, d_tmp -> d, DROP d_old`, so the target name never
    /// coexists with the temporary one after success.
    async fn swap_database(&mut self) -> CResult<()> {
        info!("initial replication - swapping database");
        let target = &self.repl.target_database;
        let tmp = &self.repl.target_database_tmp;
        let databases = self.repl.clickhouse_api.get_databases().await?;
        if databases.contains(target) {
            self.repl
                .clickhouse_api
                .execute_command(&format!(
                    "RENAME DATABASE `{}` TO `{}_old`",
                    target, target
                ))
                .await?;
            self.repl
                .clickhouse_api
                .execute_command(&format!("RENAME DATABASE `{}` TO `{}`", tmp, target))
                .await?;
            self.repl
                .clickhouse_api
                .drop_database(&format!("{}_old", target))
                .await?;
        } else {
            self.repl
                .clickhouse_api
                .execute_command(&format!("RENAME DATABASE `{}` TO `{}`", tmp, target))
                .await?;
        }
        Ok(())
    }

    async fn perform_initial_replication_table(&mut self, table_name: &str) -> CResult<()> {
        info!("running initial replication for table {}", table_name);

        if !self.repl.config.is_table_matches(table_name) {
            info!("skip table {} - not matching any allowed table", table_name);
            return Ok(());
        }

        if !self.repl.is_parallel_worker && self.repl.config.initial_replication_threads > 1 {
            self.repl.state.initial_replication_table = Some(table_name.to_string());
            self.repl.state.initial_replication_max_primary_key = None;
            self.repl.state.save()?;
            return self.perform_initial_replication_table_parallel(table_name).await;
        }

        let mut max_primary_key: Option<Vec<ColumnValue>> =
            if self.repl.state.initial_replication_table.as_deref() == Some(table_name) {
                let resume = self.repl.state.initial_replication_max_primary_key.clone();
                info!("continue from primary key {:?}", resume);
                resume
            } else {
                info!("replicating from scratch");
                self.repl.state.initial_replication_table = Some(table_name.to_string());
                self.repl.state.initial_replication_max_primary_key = None;
                self.repl.state.save()?;
                None
            };

        let (mysql_structure, clickhouse_structure) = self
            .repl
            .state
            .tables_structure
            .get(table_name)
            .cloned()
            .ok_or_else(|| {
                ReplError::Fatal(format!("no structure for table {}", table_name))
            })?;
        debug!("mysql table structure: {:?}", mysql_structure);
        debug!("clickhouse table structure: {:?}", clickhouse_structure);

        let primary_keys = clickhouse_structure.primary_keys.clone();
        let primary_key_positions = clickhouse_structure.primary_key_positions.clone();
        let batch_size = self.repl.config.initial_replication_batch_size();
        let worker = self.repl.worker_id.zip(self.repl.total_workers);

        let mut records_replicated: u64 = 0;
        let mut last_stats_dump = Instant::now();

        loop {
            let records = self
                .repl
                .mysql_api
                .get_records(
                    table_name,
                    &primary_keys,
                    batch_size,
                    max_primary_key.as_deref(),
                    worker,
                )
                .await?;
            debug!("extracted {} records from mysql", records.len());
            if records.is_empty() {
                break;
            }

            let converted = self.repl.converter.convert_records(
                &records,
                &mysql_structure,
                &clickhouse_structure,
                false,
            )?;
            self.repl
                .clickhouse_api
                .insert(table_name, &converted, &clickhouse_structure)
                .await?;

            for record in &records {
                let key: Vec<ColumnValue> = primary_key_positions
                    .iter()
                    .map(|idx| record[*idx].clone())
                    .collect();
                let advanced = match &max_primary_key {
                    Some(current) => {
                        compare_values(&key, current) == std::cmp::Ordering::Greater
                    }
                    None => true,
                };
                if advanced {
                    max_primary_key = Some(key);
                }
            }

            self.repl.state.initial_replication_max_primary_key = max_primary_key.clone();
            self.save_state_if_required(false)?;
            self.prevent_binlog_removal()?;

            records_replicated += records.len() as u64;

            if let Some(limit) = self.repl.initial_replication_test_fail_records {
                if records_replicated >= limit {
                    info!(
                        "test mode: exiting initial replication after {} records (limit {})",
                        records_replicated, limit
                    );
                    return Ok(());
                }
            }

            if last_stats_dump.elapsed() >= STATS_DUMP_INTERVAL {
                last_stats_dump = Instant::now();
                info!(
                    "replicating {}, replicated {} records, primary key: {:?}",
                    table_name, records_replicated, max_primary_key
                );
            }
        }

        info!(
            "finish replicating {}, replicated {} records, primary key: {:?}",
            table_name, records_replicated, max_primary_key
        );
        self.save_state_if_required(true)
    }

    /// Re-read every source structure and require it to match the one
    /// captured at snapshot start, otherwise the copied data cannot be
    /// trusted.
    async fn verify_table_structures_after_replication(&mut self) -> CResult<()> {
        info!("verifying table structures after initial replication");
        let mut changed_tables = Vec::new();

        let tables = self.repl.state.tables.clone();
        for table_name in &tables {
            if !self.repl.config.is_table_matches(table_name) {
                continue;
            }
            if let Some(single_table) = &self.repl.single_table {
                if single_table != table_name {
                    continue;
                }
            }

            let create_statement = self
                .repl
                .mysql_api
                .get_table_create_statement(table_name)
                .await?;
            let current_structure = self
                .repl
                .converter
                .parse_mysql_table_structure(&create_statement)?;

            let original_structure = match self.repl.state.tables_structure.get(table_name) {
                Some((mysql_structure, _)) => mysql_structure,
                None => {
                    warn!("no recorded structure for table {}", table_name);
                    continue;
                }
            };

            if structures_equal(original_structure, &current_structure) {
                debug!("table structure verification passed for {}", table_name);
            } else {
                error!(
                    "table {} structure changed during replication:\n\
                     original: {:?}\ncurrent: {:?}",
                    table_name, original_structure, current_structure
                );
                changed_tables.push(table_name.clone());
            }
        }

        if !changed_tables.is_empty() {
            return Err(ReplError::Fatal(format!(
                "structure changed during snapshot: {}. \
                 Initial replication aborted to prevent data inconsistency.",
                changed_tables.join(", ")
            )));
        }
        info!("table structure verification completed");
        Ok(())
    }

    /// Run N `db_replicator` worker processes over disjoint hash partitions
    /// of the key space, then seed the version counter from the target.
    async fn perform_initial_replication_table_parallel(
        &mut self,
        table_name: &str,
    ) -> CResult<()> {
        let total_workers = self.repl.config.initial_replication_threads;
        info!(
            "starting parallel replication for table {} with {} workers",
            table_name, total_workers
        );

        let log_dir = PathBuf::from(&self.repl.config.binlog_replicator.data_dir)
            .join(&self.repl.database)
            .join("worker_logs");
        std::fs::create_dir_all(&log_dir)?;

        let exe = std::env::current_exe()?;
        let started = Instant::now();
        let epoch_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut children = Vec::new();
        let mut log_paths = Vec::new();
        for worker_id in 0..total_workers {
            let log_path = log_dir.join(format!(
                "worker_{}_{}_{}.log",
                worker_id, table_name, epoch_seconds
            ));
            let log_file = std::fs::File::create(&log_path)?;
            let log_clone = log_file.try_clone()?;

            info!(
                "spawning snapshot worker {}/{} for table {} (log: {:?})",
                worker_id, total_workers, table_name, log_path
            );
            let child = tokio::process::Command::new(&exe)
                .arg("db_replicator")
                .arg("--config")
                .arg(&self.repl.config.settings_file)
                .arg("--db")
                .arg(&self.repl.database)
                .arg("--worker_id")
                .arg(worker_id.to_string())
                .arg("--total_workers")
                .arg(total_workers.to_string())
                .arg("--table")
                .arg(table_name)
                .arg("--target_db")
                .arg(&self.repl.target_database_tmp)
                .arg("--initial_only")
                .stdout(Stdio::from(log_file))
                .stderr(Stdio::from(log_clone))
                .spawn()?;
            children.push((worker_id, child));
            log_paths.push(log_path);
        }

        info!(
            "waiting for {} workers to complete replication of {}",
            children.len(),
            table_name
        );
        while !children.is_empty() {
            if started.elapsed() > PARALLEL_TABLE_TIMEOUT {
                for (_, child) in children.iter_mut() {
                    let _ = child.start_kill();
                }
                return Err(ReplError::Fatal(format!(
                    "worker processes for table {} timed out after {:?}",
                    table_name, PARALLEL_TABLE_TIMEOUT
                )));
            }

            let mut still_running = Vec::new();
            for (worker_id, mut child) in children {
                match child.try_wait()? {
                    Some(status) if status.success() => {
                        info!(
                            "snapshot worker {} for table {} finished (elapsed {:?})",
                            worker_id,
                            table_name,
                            started.elapsed()
                        );
                    }
                    Some(status) => {
                        let log_tail = read_log_tail(&log_paths[worker_id as usize]);
                        error!(
                            "snapshot worker {} for table {} failed ({}), last output:\n{}",
                            worker_id, table_name, status, log_tail
                        );
                        return Err(ReplError::Fatal(format!(
                            "worker process {} for table {} failed with {}",
                            worker_id, table_name, status
                        )));
                    }
                    None => still_running.push((worker_id, child)),
                }
            }
            children = still_running;
            if !children.is_empty() {
                sleep(WORKER_POLL_INTERVAL).await;
            }
        }
        info!(
            "all workers complete for table {} in {:?}",
            table_name,
            started.elapsed()
        );

        // workers partition the version space, the parent resumes after the
        // highest version actually written
        self.consolidate_worker_record_versions(table_name).await
    }

    async fn consolidate_worker_record_versions(&mut self, table_name: &str) -> CResult<()> {
        info!(
            "consolidating record versions from clickhouse for table {}",
            table_name
        );
        match self
            .repl
            .clickhouse_api
            .get_max_record_version(table_name)
            .await?
        {
            Some(max_version) => {
                let current = self
                    .repl
                    .state
                    .tables_last_record_version
                    .get(table_name)
                    .copied()
                    .unwrap_or(0);
                if max_version > current {
                    info!(
                        "updating record version for table {} from {} to {}",
                        table_name, current, max_version
                    );
                    self.repl
                        .state
                        .tables_last_record_version
                        .insert(table_name.to_string(), max_version);
                    self.repl
                        .clickhouse_api
                        .set_last_used_version(table_name, max_version);
                    self.repl.state.save()?;
                }
            }
            None => {
                // empty table: version 0 is safe, the first realtime write
                // starts at 1
                warn!("no record version found in clickhouse for table {}", table_name);
            }
        }
        Ok(())
    }
}

fn validate_mysql_structure(mysql_structure: &TableStructure) {
    for key_idx in &mysql_structure.primary_key_positions {
        let primary_field = &mysql_structure.fields[*key_idx];
        if !primary_field.parameters.to_lowercase().contains("not null") {
            warn!(
                "primary key column \"{}\" of table \"{}\" is nullable; \
                 replication of nullable primary keys is unreliable, \
                 mark the table as excluded or make the key NOT NULL",
                primary_field.name, mysql_structure.table_name
            );
        }
    }
}

/// Field-by-field comparison with whitespace-insensitive parameters.
fn structures_equal(a: &TableStructure, b: &TableStructure) -> bool {
    if a.table_name != b.table_name
        || a.charset != b.charset
        || a.primary_keys != b.primary_keys
        || a.fields.len() != b.fields.len()
    {
        return false;
    }
    a.fields.iter().zip(b.fields.iter()).all(|(fa, fb)| {
        fa.name == fb.name
            && fa.field_type == fb.field_type
            && normalize_params(&fa.parameters) == normalize_params(&fb.parameters)
    })
}

fn normalize_params(params: &str) -> String {
    params.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn read_log_tail(path: &PathBuf) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            let from = lines.len().saturating_sub(20);
            lines[from..].join("\n")
        }
        Err(err) => format!("<could not read worker log {:?}: {}>", path, err),
    }
}
