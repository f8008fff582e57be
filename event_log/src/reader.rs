use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info};

use common::config::BinlogReplicatorSettings;
use common::err::{CResult, ReplError};
use common::event::{BinlogPosition, LogEvent};

use crate::segment::{existing_file_nums, file_name_by_num};

/// How far around the first estimate to probe for the file that actually
/// contains the wanted position.
const POSITION_PROBE_RADIUS: usize = 10;

/// Reads framed events from one segment file, tolerating a partial trailing
/// record: the partial bytes stay buffered and the read is retried on the
/// next poll once the writer has flushed the rest.
struct FileReader {
    file: File,
    current_buffer: Vec<u8>,
    file_num: u64,
}

impl FileReader {
    fn open(file_path: &Path) -> CResult<Self> {
        let file_num = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                ReplError::String(format!("not an event log file: {:?}", file_path))
            })?;
        Ok(FileReader {
            file: File::open(file_path)?,
            current_buffer: Vec::new(),
            file_num,
        })
    }

    fn fill_buffer(&mut self, target_len: usize) -> CResult<()> {
        if self.current_buffer.len() >= target_len {
            return Ok(());
        }
        let mut remaining = target_len - self.current_buffer.len();
        while remaining > 0 {
            let mut chunk = vec![0u8; remaining];
            let read = self.file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            self.current_buffer.extend_from_slice(&chunk[..read]);
            remaining -= read;
        }
        Ok(())
    }

    fn read_next_event(&mut self) -> CResult<Option<LogEvent>> {
        if self.current_buffer.len() < 4 {
            self.fill_buffer(4)?;
        }
        if self.current_buffer.len() < 4 {
            return Ok(None);
        }
        let size_to_read = BigEndian::read_u32(&self.current_buffer[..4]) as usize;

        if self.current_buffer.len() != size_to_read + 4 {
            self.fill_buffer(size_to_read + 4)?;
        }
        if self.current_buffer.len() != size_to_read + 4 {
            return Ok(None);
        }

        let event: LogEvent = bincode::deserialize(&self.current_buffer[4..])?;
        self.current_buffer.clear();
        Ok(Some(event))
    }
}

/// Tails the event log of a single database, in position order, across
/// segment rotations.
pub struct EventLogReader {
    data_dir: PathBuf,
    db_name: String,
    current_file_reader: Option<FileReader>,
}

impl EventLogReader {
    pub fn new(settings: &BinlogReplicatorSettings, db_name: &str) -> Self {
        EventLogReader {
            data_dir: PathBuf::from(&settings.data_dir),
            db_name: db_name.to_string(),
            current_file_reader: None,
        }
    }

    /// Position of the last event currently stored for this database.
    /// The snapshotter records it as the point where realtime takes over.
    pub fn get_last_position(&self) -> CResult<Option<BinlogPosition>> {
        let nums = existing_file_nums(&self.data_dir, &self.db_name)?;
        let last_num = match nums.last() {
            Some(num) => *num,
            None => return Ok(None),
        };
        let mut reader =
            FileReader::open(&file_name_by_num(&self.data_dir, &self.db_name, last_num))?;
        let mut last_position = None;
        while let Some(event) = reader.read_next_event()? {
            last_position = Some(event.position);
        }
        Ok(last_position)
    }

    fn first_position_in_file(&self, file_num: u64) -> CResult<Option<BinlogPosition>> {
        let mut reader =
            FileReader::open(&file_name_by_num(&self.data_dir, &self.db_name, file_num))?;
        Ok(reader.read_next_event()?.map(|event| event.position))
    }

    fn file_has_position(&self, file_num: u64, position: &BinlogPosition) -> CResult<bool> {
        let mut reader =
            FileReader::open(&file_name_by_num(&self.data_dir, &self.db_name, file_num))?;
        while let Some(event) = reader.read_next_event()? {
            if &event.position == position {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn find_file_with_position(
        &self,
        nums: &[u64],
        position: &BinlogPosition,
    ) -> CResult<u64> {
        let mut matching_file_num = None;
        let mut prev_file_num = None;
        for file_num in nums {
            let first = self.first_position_in_file(*file_num)?;
            if let Some(first) = first {
                if &first > position {
                    matching_file_num = prev_file_num;
                    break;
                }
            }
            prev_file_num = Some(*file_num);
        }
        let matching_file_num = match matching_file_num {
            Some(num) => num,
            // no successor starts past the target, the tail is the candidate
            None => *nums.last().ok_or_else(|| {
                ReplError::Fatal(format!("no event log files for {}", self.db_name))
            })?,
        };

        let idx = nums
            .iter()
            .position(|num| *num == matching_file_num)
            .unwrap_or(0);
        let from = idx.saturating_sub(POSITION_PROBE_RADIUS);
        let to = (idx + POSITION_PROBE_RADIUS).min(nums.len());
        for file_num in &nums[from..to] {
            if self.file_has_position(*file_num, position)? {
                return Ok(*file_num);
            }
        }

        Err(ReplError::Fatal(format!(
            "position {} not found in event log of {}",
            position, self.db_name
        )))
    }

    /// Seek so that the next `read_next_event` call yields the event right
    /// after `position`. `None` starts from the very beginning.
    pub fn set_position(&mut self, position: Option<&BinlogPosition>) -> CResult<()> {
        let nums = existing_file_nums(&self.data_dir, &self.db_name)?;

        let position = match position {
            Some(position) => position,
            None => {
                match nums.first() {
                    Some(first) => {
                        let path = file_name_by_num(&self.data_dir, &self.db_name, *first);
                        info!("set position to the first file {:?}", path);
                        self.current_file_reader = Some(FileReader::open(&path)?);
                    }
                    None => {
                        info!("set position - no files found");
                        self.current_file_reader = None;
                    }
                }
                return Ok(());
            }
        };

        let matching_file_num = self.find_file_with_position(&nums, position)?;
        let path = file_name_by_num(&self.data_dir, &self.db_name, matching_file_num);
        info!("set position to {:?}", path);

        let mut reader = FileReader::open(&path)?;
        loop {
            match reader.read_next_event()? {
                Some(event) if &event.position == position => {
                    info!("found position {} inside {:?}", position, path);
                    self.current_file_reader = Some(reader);
                    return Ok(());
                }
                Some(event) if &event.position > position => break,
                Some(_) => continue,
                None => break,
            }
        }
        Err(ReplError::Fatal(format!(
            "position {} not found in {:?}",
            position, path
        )))
    }

    pub fn read_next_event(&mut self) -> CResult<Option<LogEvent>> {
        let reader = match self.current_file_reader.as_mut() {
            Some(reader) => reader,
            None => {
                // no reader yet - start from the first file once it appears
                let nums = existing_file_nums(&self.data_dir, &self.db_name)?;
                let first = match nums.first() {
                    Some(num) => *num,
                    None => return Ok(None),
                };
                let path = file_name_by_num(&self.data_dir, &self.db_name, first);
                self.current_file_reader = Some(FileReader::open(&path)?);
                return self.read_next_event();
            }
        };

        let result = reader.read_next_event()?;
        if result.is_some() {
            return Ok(result);
        }

        // current file exhausted - switch once the next one appears
        let next_file_num = reader.file_num + 1;
        let next_path = file_name_by_num(&self.data_dir, &self.db_name, next_file_num);
        if !next_path.exists() {
            return Ok(None);
        }
        debug!("switching to next file {:?}", next_path);
        self.current_file_reader = Some(FileReader::open(&next_path)?);
        self.read_next_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DataWriter;
    use common::event::{ColumnValue, EventKind};
    use std::io::Write;

    fn settings(dir: &Path) -> BinlogReplicatorSettings {
        BinlogReplicatorSettings {
            data_dir: dir.to_string_lossy().to_string(),
            records_per_file: 2,
            binlog_retention_period: 3600,
        }
    }

    fn event(pos: u64) -> LogEvent {
        LogEvent::row_event(
            BinlogPosition::new("mysql-bin.000001", pos),
            "db",
            "t1",
            EventKind::Insert,
            vec![vec![ColumnValue::Int(pos as i64)]],
        )
    }

    #[test]
    fn test_read_across_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DataWriter::new(&settings(dir.path())).unwrap();
        for pos in 1..=5 {
            writer.store_event(&event(pos)).unwrap();
        }
        writer.close_all().unwrap();

        let mut reader = EventLogReader::new(&settings(dir.path()), "db");
        reader.set_position(None).unwrap();
        let mut positions = Vec::new();
        while let Some(event) = reader.read_next_event().unwrap() {
            positions.push(event.position.pos);
        }
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_set_position_resumes_after_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DataWriter::new(&settings(dir.path())).unwrap();
        for pos in 1..=6 {
            writer.store_event(&event(pos)).unwrap();
        }
        writer.close_all().unwrap();

        let mut reader = EventLogReader::new(&settings(dir.path()), "db");
        reader
            .set_position(Some(&BinlogPosition::new("mysql-bin.000001", 3)))
            .unwrap();
        let next = reader.read_next_event().unwrap().unwrap();
        assert_eq!(next.position.pos, 4);
    }

    #[test]
    fn test_set_position_missing_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DataWriter::new(&settings(dir.path())).unwrap();
        writer.store_event(&event(1)).unwrap();
        writer.close_all().unwrap();

        let mut reader = EventLogReader::new(&settings(dir.path()), "db");
        let missing = BinlogPosition::new("mysql-bin.000001", 999);
        assert!(reader.set_position(Some(&missing)).is_err());
    }

    #[test]
    fn test_partial_trailing_record_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DataWriter::new(&settings(dir.path())).unwrap();
        writer.store_event(&event(1)).unwrap();
        writer.close_all().unwrap();

        let mut reader = EventLogReader::new(&settings(dir.path()), "db");
        reader.set_position(None).unwrap();
        assert_eq!(reader.read_next_event().unwrap().unwrap().position.pos, 1);
        assert!(reader.read_next_event().unwrap().is_none());

        // simulate the writer mid-record: length header without payload
        let path = file_name_by_num(dir.path(), "db", 1);
        let payload = bincode::serialize(&event(2)).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
        file.flush().unwrap();
        assert!(reader.read_next_event().unwrap().is_none());

        // the rest of the record arrives, the buffered prefix is reused
        file.write_all(&payload).unwrap();
        file.flush().unwrap();
        assert_eq!(reader.read_next_event().unwrap().unwrap().position.pos, 2);
    }

    #[test]
    fn test_last_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DataWriter::new(&settings(dir.path())).unwrap();
        for pos in 1..=5 {
            writer.store_event(&event(pos)).unwrap();
        }
        writer.close_all().unwrap();

        let reader = EventLogReader::new(&settings(dir.path()), "db");
        let last = reader.get_last_position().unwrap().unwrap();
        assert_eq!(last.pos, 5);
    }

    #[test]
    fn test_reader_waits_for_first_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = EventLogReader::new(&settings(dir.path()), "db");
        reader.set_position(None).unwrap();
        assert!(reader.read_next_event().unwrap().is_none());

        let mut writer = DataWriter::new(&settings(dir.path())).unwrap();
        writer.store_event(&event(1)).unwrap();
        writer.close_all().unwrap();
        assert_eq!(reader.read_next_event().unwrap().unwrap().position.pos, 1);
    }
}
