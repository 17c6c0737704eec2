//! Value file storage implementation.

use crate::atomic::{self, NEW_EXT};
use crate::error::Result;
use crate::sanitize::KeySanitizer;
use crate::types::{Timestamp, UNKNOWN_MOD_TIME};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Number of locks value writes are spread over.
const WRITE_STRIPES: usize = 64;

/// One file per key, written through the atomic writer.
pub struct ValueStorage {
    /// Store directory.
    path: PathBuf,

    /// Suffix appended to every value file.
    extension: String,

    /// Key to file stem mapping.
    sanitizer: Arc<dyn KeySanitizer>,

    /// Fsync the directory after each rename.
    sync_dir: bool,

    /// Writers of one file share its `.new` temporary, so writes and
    /// deletes of the same path are serialized on the stripe it hashes to.
    write_locks: Box<[Mutex<()>]>,
}

impl ValueStorage {
    /// Create value storage in `path`, creating the directory if missing.
    pub fn new(
        path: impl AsRef<Path>,
        extension: impl Into<String>,
        sanitizer: Arc<dyn KeySanitizer>,
        sync_dir: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        Ok(Self {
            path,
            extension: extension.into(),
            sanitizer,
            sync_dir,
            write_locks: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Open the value file for `key`, or `None` if it is absent.
    pub fn get(&self, key: &str) -> Result<Option<File>> {
        match File::open(self.value_path(key)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the value file for `key`.
    pub fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.value_path(key);
        let _guard = self.write_lock(&path);
        atomic::write_atomically(&path, content, self.sync_dir)
    }

    /// Remove the value file. Returns whether a file was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let path = self.value_path(key);
        let _guard = self.write_lock(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a value file exists.
    pub fn exists(&self, key: &str) -> bool {
        self.value_path(key).is_file()
    }

    /// Filesystem modification time of the value file in unix seconds.
    pub fn mod_time(&self, key: &str) -> Result<i64> {
        match fs::metadata(self.value_path(key)) {
            Ok(meta) => Ok(Timestamp::from_system_time(meta.modified()?).0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(UNKNOWN_MOD_TIME),
            Err(e) => Err(e.into()),
        }
    }

    /// File stems of all value files carrying this store's extension.
    ///
    /// Temporaries of interrupted writes are skipped. Bookkeeping files that
    /// happen to carry the extension are the caller's to filter out.
    pub fn list_stems(&self) -> Result<Vec<String>> {
        let mut stems = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();
            if filename.ends_with(NEW_EXT) {
                continue;
            }
            if let Some(stem) = filename.strip_suffix(self.extension.as_str()) {
                if !stem.is_empty() {
                    stems.push(stem.to_string());
                }
            }
        }

        stems.sort();
        Ok(stems)
    }

    /// Full path of the value file for `key`.
    pub fn value_path(&self, key: &str) -> PathBuf {
        let mut name = self.sanitizer.sanitize(key);
        name.push_str(&self.extension);
        self.path.join(name)
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    fn write_lock(&self, path: &Path) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        self.write_locks[hasher.finish() as usize % self.write_locks.len()].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::DefaultSanitizer;
    use std::io::Read;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> ValueStorage {
        ValueStorage::new(dir.path().join("values"), ".json", Arc::new(DefaultSanitizer), false)
            .unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        storage.put("answer", b"42").unwrap();

        let mut content = String::new();
        storage
            .get("answer")
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "42");
        assert!(storage.value_path("answer").ends_with("answer.json"));
    }

    #[test]
    fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        assert!(storage.get("nope").unwrap().is_none());
        assert_eq!(storage.mod_time("nope").unwrap(), UNKNOWN_MOD_TIME);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        storage.put("gone", b"x").unwrap();
        assert!(storage.exists("gone"));
        assert!(storage.delete("gone").unwrap());
        assert!(!storage.exists("gone"));

        // Absence is not an error
        assert!(!storage.delete("gone").unwrap());
    }

    #[test]
    fn test_list_stems_skips_temporaries() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        storage.put("b", b"1").unwrap();
        storage.put("a", b"2").unwrap();
        storage.put("", b"3").unwrap();
        fs::write(dir.path().join("values").join("_stray.json"), b"").unwrap();
        fs::write(dir.path().join("values").join("c.json.new"), b"").unwrap();
        fs::write(dir.path().join("values").join("d.html"), b"").unwrap();

        assert_eq!(storage.list_stems().unwrap(), vec!["%", "_stray", "a", "b"]);
    }

    #[test]
    fn test_concurrent_puts_to_one_key() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        std::thread::scope(|s| {
            for t in 0..8 {
                let storage = &storage;
                s.spawn(move || {
                    for i in 0..20 {
                        storage.put("hot", format!("{t}:{i}").as_bytes()).unwrap();
                    }
                });
            }
        });

        let content = fs::read_to_string(storage.value_path("hot")).unwrap();
        assert!(content.ends_with(":19"), "unexpected content {content:?}");
        assert!(!atomic::new_path(&storage.value_path("hot")).exists());
    }
}
