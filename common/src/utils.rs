use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::err::CResult;

/// Write a state file atomically: write to `<path>.tmp`, then rename over
/// the final name so readers never observe a torn file.
pub fn write_atomic(path: &Path, data: &[u8]) -> CResult<()> {
    let mut tmp_path = PathBuf::from(path);
    tmp_path.set_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Update mtime of every file directly under `directory_path`.
/// Used by the snapshotter to keep retention away from event log files
/// it still needs to catch up to.
pub fn touch_all_files(directory_path: &Path) -> CResult<()> {
    for entry in fs::read_dir(directory_path)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        if let Err(err) = touch_file(&entry.path()) {
            warn!("failed to touch {:?}: {}", entry.path(), err);
        }
    }
    Ok(())
}

fn touch_file(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    // a null timevec sets both access and modification times to now
    let rc = unsafe { libc::utimes(c_path.as_ptr(), std::ptr::null()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Cooperative shutdown flag driven by SIGINT/SIGTERM.
/// Every service loop polls `kill_now()` once per turn.
#[derive(Debug, Clone)]
pub struct GracefulKiller {
    flag: Arc<AtomicBool>,
}

impl Default for GracefulKiller {
    fn default() -> Self {
        GracefulKiller {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl GracefulKiller {
    /// Install the signal listeners. Must be called from within a tokio
    /// runtime; the listener tasks live until the process exits.
    pub fn install() -> Self {
        let killer = GracefulKiller::default();
        killer.spawn_listener(tokio::signal::unix::SignalKind::interrupt());
        killer.spawn_listener(tokio::signal::unix::SignalKind::terminate());
        killer
    }

    fn spawn_listener(&self, kind: tokio::signal::unix::SignalKind) {
        let flag = Arc::clone(&self.flag);
        tokio::spawn(async move {
            match tokio::signal::unix::signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    flag.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    warn!("failed to install signal handler: {}", err);
                }
            }
        });
    }

    pub fn kill_now(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown programmatically (used by auto-restart and tests).
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // the temp file never survives
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_killer_trigger() {
        let killer = GracefulKiller::default();
        assert!(!killer.kill_now());
        killer.trigger();
        assert!(killer.kill_now());
    }
}
