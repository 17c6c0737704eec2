//! The log file on disk.

use super::codec;
use crate::atomic;
use crate::error::Result;
use crate::types::{LogRecord, Timestamp, UNKNOWN_MOD_TIME};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Name of the log file inside a store directory.
pub const LOG_FILENAME: &str = "_log.msgpack";

/// Name of the advisory lock file guarding log rewrites.
pub const LOCK_FILENAME: &str = "_log.lock";

/// Identity of a log file version: modification time and length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    modified: SystemTime,
    len: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self
            .modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        write!(f, "mtime={}ns len={}", nanos, self.len)
    }
}

/// Handle to a store's log file.
pub struct LogFile {
    path: PathBuf,
    lock_path: PathBuf,
    sync_dir: bool,
}

/// Held while a log rewrite is in progress; released on drop.
pub struct LogLock {
    file: File,
}

impl Drop for LogLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl LogFile {
    pub fn new(dir: impl AsRef<Path>, sync_dir: bool) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(LOG_FILENAME),
            lock_path: dir.join(LOCK_FILENAME),
            sync_dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Read and decode the log. A missing file is an empty log.
    pub fn load(&self) -> Result<(Vec<LogRecord>, Option<Fingerprint>)> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e.into()),
        };

        let records = codec::decode(&bytes)?;
        let fingerprint = self.fingerprint()?;
        debug!(path = %self.path.display(), records = records.len(), "loaded log");

        Ok((records, fingerprint))
    }

    /// Encode and atomically replace the log file.
    pub fn write(&self, records: &[LogRecord]) -> Result<Option<Fingerprint>> {
        let bytes = codec::encode(records)?;
        atomic::write_atomically(&self.path, &bytes[..], self.sync_dir)?;
        debug!(path = %self.path.display(), records = records.len(), "rewrote log");
        self.fingerprint()
    }

    /// Current fingerprint of the file, `None` if absent.
    pub fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(Fingerprint {
                modified: meta.modified()?,
                len: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Modification time of the file in unix seconds.
    pub fn mod_time(&self) -> Result<i64> {
        match self.fingerprint()? {
            Some(fp) => Ok(Timestamp::from_system_time(fp.modified).0),
            None => Ok(UNKNOWN_MOD_TIME),
        }
    }

    /// Block until the advisory rewrite lock is held.
    pub fn lock(&self) -> Result<LogLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(LogLock { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::types::Hash;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = LogFile::new(dir.path(), false);

        let (records, fingerprint) = file.load().unwrap();
        assert!(records.is_empty());
        assert!(fingerprint.is_none());
        assert_eq!(file.mod_time().unwrap(), UNKNOWN_MOD_TIME);
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let file = LogFile::new(dir.path(), true);
        let records = vec![LogRecord::create("k", Hash::from_bytes(b"v"), Timestamp(3))];

        let written = file.write(&records).unwrap();
        let (loaded, fingerprint) = file.load().unwrap();

        assert_eq!(loaded, records);
        assert_eq!(fingerprint, written);
        assert!(file.mod_time().unwrap() > 0);
    }

    #[test]
    fn test_corrupt_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let file = LogFile::new(dir.path(), false);
        fs::write(file.path(), b"definitely not a log").unwrap();

        let err = file.load().unwrap_err();
        assert!(err.is_decode_error(), "unexpected error: {err}");
        assert!(matches!(err, StoreError::InvalidFormat(_)));
    }

    #[test]
    fn test_lock_is_reentrant_after_drop() {
        let dir = TempDir::new().unwrap();
        let file = LogFile::new(dir.path(), false);

        drop(file.lock().unwrap());
        let _again = file.lock().unwrap();
    }
}
