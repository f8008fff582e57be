use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use common::err::CResult;
use common::event::BinlogPosition;
use common::utils::write_atomic;

/// Durable resume state of the binlog reader (`<data_dir>/state.json`).
///
/// Two positions are kept: the reader resumes from
/// `prev_last_seen_transaction` so that a crash between saves can never skip
/// an event. The one step of rewind this allows is deduplicated downstream
/// by the realtime applier.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BinlogState {
    #[serde(skip)]
    file_name: PathBuf,
    pub last_seen_transaction: Option<BinlogPosition>,
    pub prev_last_seen_transaction: Option<BinlogPosition>,
    pub pid: Option<u32>,
}

impl BinlogState {
    pub fn load(file_name: &Path) -> CResult<Self> {
        let mut state = if file_name.exists() {
            let data = fs::read_to_string(file_name)?;
            serde_json::from_str(&data)?
        } else {
            BinlogState::default()
        };
        state.file_name = file_name.to_path_buf();
        Ok(state)
    }

    pub fn save(&mut self) -> CResult<()> {
        self.pid = Some(std::process::id());
        let data = serde_json::to_vec(self)?;
        write_atomic(&self.file_name, &data)?;
        Ok(())
    }

    /// Rotate `(last, prev) <- (current, last)` before saving.
    pub fn update_position(&mut self, position: Option<BinlogPosition>) {
        self.prev_last_seen_transaction = self.last_seen_transaction.take();
        self.last_seen_transaction = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = BinlogState::load(&path).unwrap();
        assert!(state.last_seen_transaction.is_none());

        state.update_position(Some(BinlogPosition::new("mysql-bin.000002", 120)));
        state.update_position(Some(BinlogPosition::new("mysql-bin.000002", 250)));
        state.save().unwrap();

        let restored = BinlogState::load(&path).unwrap();
        assert_eq!(
            restored.last_seen_transaction,
            Some(BinlogPosition::new("mysql-bin.000002", 250))
        );
        assert_eq!(
            restored.prev_last_seen_transaction,
            Some(BinlogPosition::new("mysql-bin.000002", 120))
        );
        assert_eq!(restored.pid, Some(std::process::id()));
    }
}
