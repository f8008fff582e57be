use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use byteorder::{BigEndian, WriteBytesExt};
use tracing::debug;

use common::config::BinlogReplicatorSettings;
use common::err::CResult;
use common::event::LogEvent;

use crate::segment::{existing_file_nums, file_name_by_num};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// The last files of every database directory are exempt from retention so
/// a lagging reader can always resume.
const PRESERVE_FILES_COUNT: usize = 5;

/// Appends framed events to a single segment file.
struct FileWriter {
    file: File,
    num_records: u64,
    last_flush_time: Instant,
}

impl FileWriter {
    fn create(file_path: &Path) -> CResult<Self> {
        let file = File::create(file_path)?;
        Ok(FileWriter {
            file,
            num_records: 0,
            last_flush_time: Instant::now(),
        })
    }

    fn write_event(&mut self, log_event: &LogEvent) -> CResult<()> {
        let data = bincode::serialize(log_event)?;
        self.file.write_u32::<BigEndian>(data.len() as u32)?;
        self.file.write_all(&data)?;
        if self.last_flush_time.elapsed() > FLUSH_INTERVAL {
            self.file.flush()?;
            self.last_flush_time = Instant::now();
        }
        self.num_records += log_event.rows.len().max(1) as u64;
        Ok(())
    }

    fn close(mut self) -> CResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Routes events into per-database segment files, rotating by record count.
pub struct DataWriter {
    data_dir: PathBuf,
    records_per_file: u64,
    db_file_writers: HashMap<String, FileWriter>,
}

impl DataWriter {
    pub fn new(settings: &BinlogReplicatorSettings) -> CResult<Self> {
        let data_dir = PathBuf::from(&settings.data_dir);
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        Ok(DataWriter {
            data_dir,
            records_per_file: settings.records_per_file,
            db_file_writers: HashMap::new(),
        })
    }

    pub fn store_event(&mut self, log_event: &LogEvent) -> CResult<()> {
        debug!("store event {}", log_event.position);
        if let Some(writer) = self.db_file_writers.get(&log_event.db_name) {
            if writer.num_records >= self.records_per_file {
                if let Some(full) = self.db_file_writers.remove(&log_event.db_name) {
                    full.close()?;
                }
            }
        }
        if !self.db_file_writers.contains_key(&log_event.db_name) {
            let writer = self.create_file_writer(&log_event.db_name)?;
            self.db_file_writers
                .insert(log_event.db_name.clone(), writer);
        }
        // the entry is guaranteed present here
        if let Some(writer) = self.db_file_writers.get_mut(&log_event.db_name) {
            writer.write_event(log_event)?;
        }
        Ok(())
    }

    fn create_file_writer(&self, db_name: &str) -> CResult<FileWriter> {
        let nums = existing_file_nums(&self.data_dir, db_name)?;
        let next_num = nums.last().copied().unwrap_or(0) + 1;
        let path = file_name_by_num(&self.data_dir, db_name, next_num);
        FileWriter::create(&path)
    }

    /// Delete segment files last modified before `ts_from`, always keeping
    /// the current tail and the PRESERVE_FILES_COUNT files before it.
    pub fn remove_old_files(&self, ts_from: SystemTime) -> CResult<()> {
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let db_name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let nums = existing_file_nums(&self.data_dir, &db_name)?;
            if nums.len() <= PRESERVE_FILES_COUNT + 1 {
                continue;
            }
            let removable = &nums[..nums.len() - 1 - PRESERVE_FILES_COUNT];
            for num in removable {
                let path = file_name_by_num(&self.data_dir, &db_name, *num);
                let modified = fs::metadata(&path)?.modified()?;
                if modified <= ts_from {
                    debug!("removing old segment {:?}", path);
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn close_all(&mut self) -> CResult<()> {
        for (_, writer) in self.db_file_writers.drain() {
            writer.close()?;
        }
        Ok(())
    }
}
