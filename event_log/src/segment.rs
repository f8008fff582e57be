use std::fs;
use std::path::{Path, PathBuf};

use common::err::CResult;

pub const SEGMENT_FILE_EXT: &str = "bin";

/// Numbers of the existing `<N>.bin` segment files of a database directory,
/// sorted ascending. Creates the directory if it does not exist yet.
pub fn existing_file_nums(data_dir: &Path, db_name: &str) -> CResult<Vec<u64>> {
    let db_path = data_dir.join(db_name);
    if !db_path.exists() {
        fs::create_dir_all(&db_path)?;
    }
    let mut nums = Vec::new();
    for entry in fs::read_dir(&db_path)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_FILE_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(num) = stem.parse::<u64>() {
                nums.push(num);
            }
        }
    }
    nums.sort_unstable();
    Ok(nums)
}

pub fn file_name_by_num(data_dir: &Path, db_name: &str, file_num: u64) -> PathBuf {
    data_dir
        .join(db_name)
        .join(format!("{}.{}", file_num, SEGMENT_FILE_EXT))
}
