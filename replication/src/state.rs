use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use common::err::CResult;
use common::event::{BinlogPosition, ColumnValue};
use common::schema::TableStructure;
use common::utils::write_atomic;

/// Lifecycle of a per-database replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    None,
    CreatingInitialStructures,
    PerformingInitialReplication,
    RunningRealtimeReplication,
}

impl Default for Status {
    fn default() -> Self {
        Status::None
    }
}

/// Durable state of one database replicator (`<data_dir>/<db>/state.pckl`,
/// or the worker-specific file in parallel snapshot mode). Serialized with
/// bincode and written atomically.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DbState {
    #[serde(skip)]
    file_name: PathBuf,

    pub status: Status,
    /// durable position: everything up to here is uploaded to the target
    pub last_processed_transaction: Option<BinlogPosition>,
    /// advances per consumed event, becomes durable on flush
    #[serde(skip)]
    pub last_processed_transaction_non_uploaded: Option<BinlogPosition>,
    /// table -> last `_version` written
    pub tables_last_record_version: HashMap<String, u64>,
    /// snapshot resume cursor
    pub initial_replication_table: Option<String>,
    pub initial_replication_max_primary_key: Option<Vec<ColumnValue>>,
    /// table -> (mysql structure, clickhouse structure)
    pub tables_structure: HashMap<String, (TableStructure, TableStructure)>,
    /// tables selected for this database at bootstrap
    pub tables: Vec<String>,
    pub pid: Option<u32>,
}

impl DbState {
    pub fn load(file_name: &Path) -> CResult<Self> {
        let mut state: DbState = if file_name.exists() {
            bincode::deserialize(&fs::read(file_name)?)?
        } else {
            DbState::default()
        };
        state.file_name = file_name.to_path_buf();
        state.last_processed_transaction_non_uploaded = state.last_processed_transaction.clone();
        Ok(state)
    }

    pub fn save(&mut self) -> CResult<()> {
        self.pid = Some(std::process::id());
        let data = bincode::serialize(self)?;
        write_atomic(&self.file_name, &data)?;
        Ok(())
    }

    pub fn remove(&self) -> CResult<()> {
        if self.file_name.exists() {
            fs::remove_file(&self.file_name)?;
        }
        let mut tmp = self.file_name.clone();
        tmp.set_extension("pckl.tmp");
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        Ok(())
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }
}
