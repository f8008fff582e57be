use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use common::config::Settings;
use common::err::{CResult, ReplError};
use common::event::{BinlogPosition, LogEvent};
use common::utils::GracefulKiller;
use event_log::state::BinlogState;
use event_log::writer::DataWriter;

use crate::query_parser::try_parse_db_name_from_query;
use crate::stream::{BinlogSource, SourceEvent};

const SAVE_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
const BINLOG_CLEAN_INTERVAL: Duration = Duration::from_secs(5 * 60);
const READ_LOG_INTERVAL: Duration = Duration::from_millis(300);
/// Upper bound on one blocking stream read, so bookkeeping (state saves,
/// retention) runs even on an idle source.
const READ_EVENT_TIMEOUT: Duration = Duration::from_secs(1);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// Events pulled per outer loop turn before bookkeeping runs.
const MAX_BATCH_EVENTS: usize = 1000;
/// Below this batch size the loop sleeps to avoid hot spinning.
const SMALL_BATCH_EVENTS: usize = 50;

/// The binlog reader service: pulls the replication stream, filters events
/// and appends them to the per-database event log.
pub struct BinlogReplicator {
    settings: Settings,
    data_writer: DataWriter,
    state: BinlogState,
    source: Option<BinlogSource>,
    last_state_update: Instant,
    last_binlog_clear_time: Instant,
}

impl BinlogReplicator {
    pub fn new(settings: Settings) -> CResult<Self> {
        let data_dir = PathBuf::from(&settings.binlog_replicator.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let data_writer = DataWriter::new(&settings.binlog_replicator)?;
        let state = BinlogState::load(&data_dir.join("state.json"))?;
        info!(
            "state start position: {:?}",
            state.prev_last_seen_transaction
        );

        Ok(BinlogReplicator {
            settings,
            data_writer,
            state,
            source: None,
            last_state_update: Instant::now() - SAVE_UPDATE_INTERVAL,
            last_binlog_clear_time: Instant::now(),
        })
    }

    async fn connect(&mut self) -> CResult<()> {
        let source = BinlogSource::connect(
            &self.settings.mysql,
            self.state.prev_last_seen_transaction.as_ref(),
        )
        .await?;
        self.source = Some(source);
        Ok(())
    }

    pub async fn run(&mut self) -> CResult<()> {
        let killer = GracefulKiller::install();

        let mut last_position: Option<BinlogPosition> = None;
        let mut last_log_time = Instant::now();
        let mut total_processed_events: u64 = 0;

        while !killer.kill_now() {
            if self.source.is_none() {
                match self.connect().await {
                    Ok(()) => {}
                    Err(err) => {
                        self.handle_source_error(err).await?;
                        continue;
                    }
                }
            }

            if last_log_time.elapsed() > STATS_LOG_INTERVAL {
                last_log_time = Instant::now();
                info!(
                    "last position: {:?}, processed events: {}",
                    last_position, total_processed_events
                );
            }

            let mut last_read_count = 0;
            while last_read_count < MAX_BATCH_EVENTS && !killer.kill_now() {
                let read = match self.source.as_mut() {
                    Some(source) => {
                        match tokio::time::timeout(READ_EVENT_TIMEOUT, source.read_event()).await
                        {
                            Ok(read) => read,
                            // idle source, fall through to bookkeeping
                            Err(_) => break,
                        }
                    }
                    None => break,
                };
                let (position, source_event) = match read {
                    Ok(Some(item)) => item,
                    Ok(None) => {
                        warn!("binlog stream closed by the server, reconnecting");
                        self.source = None;
                        break;
                    }
                    Err(err) => {
                        self.handle_source_error(err).await?;
                        break;
                    }
                };

                last_read_count += 1;
                total_processed_events += 1;
                last_position = Some(position.clone());
                self.update_state_if_required(last_position.clone(), false)?;

                if let Some(log_event) = self.match_event(position, source_event) {
                    if self.settings.debug_log_level {
                        debug!(
                            "store event {}, kind: {:?}, database: {}, table: {}, rows: {}",
                            log_event.position,
                            log_event.kind,
                            log_event.db_name,
                            log_event.table_name,
                            log_event.rows.len(),
                        );
                    }
                    self.data_writer.store_event(&log_event)?;
                }
            }

            self.update_state_if_required(last_position.clone(), false)?;
            self.clear_old_binlog_if_required()?;
            if last_read_count < SMALL_BATCH_EVENTS {
                sleep(READ_LOG_INTERVAL).await;
            }
        }

        info!("stopping binlog replicator");
        self.data_writer.close_all()?;
        self.update_state_if_required(last_position, true)?;
        info!("stopped");
        Ok(())
    }

    /// Apply the db/table filters and build the event log record.
    /// Dropped events advance the position but are not written.
    fn match_event(
        &self,
        position: BinlogPosition,
        source_event: SourceEvent,
    ) -> Option<LogEvent> {
        match source_event {
            SourceEvent::Rows {
                db_name,
                table_name,
                kind,
                rows,
            } => {
                if !self.settings.is_table_matches(&table_name) {
                    return None;
                }
                if !self.settings.is_database_matches(&db_name) {
                    return None;
                }
                Some(LogEvent::row_event(position, db_name, table_name, kind, rows))
            }
            SourceEvent::Query { db_name, query } => {
                let parsed_db_name = try_parse_db_name_from_query(&query);
                let db_name = if parsed_db_name.is_empty() {
                    db_name
                } else {
                    parsed_db_name
                };
                if !self.settings.is_database_matches(&db_name) {
                    return None;
                }
                Some(LogEvent::query_event(position, db_name, query))
            }
            SourceEvent::Other => None,
        }
    }

    async fn handle_source_error(&mut self, err: ReplError) -> CResult<()> {
        match err {
            ReplError::CorruptedIndex(message) => {
                error!(
                    "source reported corrupted binlog index: {}; \
                     wiping the event log and restarting from the stream end",
                    message
                );
                self.recover_from_corrupted_index()?;
                Err(ReplError::CorruptedIndex(message))
            }
            ReplError::TransientSource(message) => {
                error!("operational source error: {}", message);
                self.source = None;
                sleep(RECONNECT_DELAY).await;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Destructive recovery: the history referenced by our saved position is
    /// gone, so historical gap-fill is traded for liveness. The supervisor
    /// respawns the process, which then subscribes from the current end.
    fn recover_from_corrupted_index(&mut self) -> CResult<()> {
        let data_dir = Path::new(&self.settings.binlog_replicator.data_dir);
        if data_dir.exists() {
            warn!("deleting event log directory {:?}", data_dir);
            std::fs::remove_dir_all(data_dir)?;
        }
        Ok(())
    }

    fn update_state_if_required(
        &mut self,
        position: Option<BinlogPosition>,
        force: bool,
    ) -> CResult<()> {
        if self.last_state_update.elapsed() < SAVE_UPDATE_INTERVAL && !force {
            return Ok(());
        }
        let data_dir = Path::new(&self.settings.binlog_replicator.data_dir);
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)?;
        }
        self.state.update_position(position);
        self.state.save()?;
        self.last_state_update = Instant::now();
        Ok(())
    }

    fn clear_old_binlog_if_required(&mut self) -> CResult<()> {
        if self.last_binlog_clear_time.elapsed() < BINLOG_CLEAN_INTERVAL {
            return Ok(());
        }
        self.last_binlog_clear_time = Instant::now();
        let cutoff = SystemTime::now()
            - Duration::from_secs(self.settings.binlog_replicator.binlog_retention_period);
        self.data_writer.remove_old_files(cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::event::{ColumnValue, EventKind};
    use common::pattern::PatternList;

    fn replicator_with_filters(dir: &Path) -> BinlogReplicator {
        let mut settings = Settings::default();
        settings.binlog_replicator.data_dir = dir.to_string_lossy().to_string();
        settings.databases = PatternList::Single("test_db_*".to_string());
        settings.exclude_tables = PatternList::Single("skip_me".to_string());
        BinlogReplicator::new(settings).unwrap()
    }

    fn rows_event(db: &str, table: &str) -> SourceEvent {
        SourceEvent::Rows {
            db_name: db.to_string(),
            table_name: table.to_string(),
            kind: EventKind::Insert,
            rows: vec![vec![ColumnValue::Int(1)]],
        }
    }

    #[test]
    fn test_match_event_filters_database() {
        let dir = tempfile::tempdir().unwrap();
        let replicator = replicator_with_filters(dir.path());
        let position = BinlogPosition::new("mysql-bin.000001", 4);
        assert!(replicator
            .match_event(position.clone(), rows_event("test_db_1", "t"))
            .is_some());
        assert!(replicator
            .match_event(position, rows_event("other", "t"))
            .is_none());
    }

    #[test]
    fn test_match_event_filters_table() {
        let dir = tempfile::tempdir().unwrap();
        let replicator = replicator_with_filters(dir.path());
        let position = BinlogPosition::new("mysql-bin.000001", 4);
        assert!(replicator
            .match_event(position, rows_event("test_db_1", "skip_me"))
            .is_none());
    }

    #[test]
    fn test_query_event_db_name_from_statement() {
        let dir = tempfile::tempdir().unwrap();
        let replicator = replicator_with_filters(dir.path());
        let position = BinlogPosition::new("mysql-bin.000001", 4);

        // the session schema does not match, the statement names a db that does
        let event = replicator.match_event(
            position.clone(),
            SourceEvent::Query {
                db_name: "other".to_string(),
                query: "ALTER TABLE test_db_1.t ADD COLUMN c int".to_string(),
            },
        );
        assert_eq!(event.unwrap().db_name, "test_db_1");

        // no qualifier in the statement, the session schema decides
        let event = replicator.match_event(
            position,
            SourceEvent::Query {
                db_name: "other".to_string(),
                query: "ALTER TABLE t ADD COLUMN c int".to_string(),
            },
        );
        assert!(event.is_none());
    }
}
