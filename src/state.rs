use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StoreError;
use crate::store::Tables;

pub const DEFAULT_STATE_FILE: &str = ".mutduel-state.json";

pub fn default_state_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(DEFAULT_STATE_FILE)
}

/// Advisory lock on a snapshot, held through a sibling `.lock` file so the
/// snapshot itself can be replaced by rename while locked. Released on drop.
#[derive(Debug)]
pub struct SnapshotLock {
    _file: File,
}

/// Blocks until the lock for `path` is held. Writers take it exclusively for
/// the whole reload-modify-save cycle; readers share it.
pub fn lock_snapshot(path: &Path, exclusive: bool) -> Result<SnapshotLock, StoreError> {
    let lock_path = path.with_extension("lock");
    let persist = |source| StoreError::Persist {
        path: lock_path.clone(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(persist)?;
    flock(&file, exclusive).map_err(persist)?;
    Ok(SnapshotLock { _file: file })
}

fn flock(file: &File, exclusive: bool) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        loop {
            // SAFETY: flock is a standard POSIX call on a descriptor owned by
            // `file`, which outlives the call.
            #[allow(unsafe_code)]
            let result = unsafe { libc::flock(file.as_raw_fd(), op) };
            if result == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (file, exclusive);
        Ok(())
    }
}

/// Writes the snapshot to a fresh temporary file beside `path` and renames it
/// into place, so a reader never sees a half-written file.
pub fn save_snapshot(tables: &Tables, path: &Path) -> Result<(), StoreError> {
    let persist = |source| StoreError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec(tables).map_err(|e| persist(std::io::Error::other(e)))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persist)?;
    tmp.write_all(&json).map_err(persist)?;
    tmp.persist(path).map_err(|e| persist(e.error))?;
    debug!(path = %path.display(), "snapshot saved");
    Ok(())
}

/// `Ok(None)` when there is no snapshot yet.
pub fn load_snapshot(path: &Path) -> Result<Option<Tables>, StoreError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Persist {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let tables = serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(tables))
}
