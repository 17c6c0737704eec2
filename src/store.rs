//! Main Store struct tying all components together.

use crate::atomic::{self, NEW_EXT};
use crate::error::{Result, StoreError};
use crate::migrate::LEGACY_INDEX_FILENAME;
use crate::records::{Fingerprint, LogFile, MutationLog};
use crate::sanitize::{DefaultSanitizer, KeySanitizer};
use crate::types::{Hash, LogRecord, MutationType, Timestamp};
use crate::values::ValueStorage;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const JSON_EXT: &str = ".json";
pub const GOB_EXT: &str = ".gob";
pub const HTML_EXT: &str = ".html";
pub const XML_EXT: &str = ".xml";

/// What to do when the log file was changed by someone else since it was
/// last loaded or written by this handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StalenessPolicy {
    /// Keep using the in-memory log; the next rewrite overwrites the other
    /// writer's changes.
    Ignore,
    /// Reload the log from disk before mutating it.
    #[default]
    Reload,
    /// Refuse to mutate with [`StoreError::StaleLog`] until [`Store::refresh`]
    /// is called.
    Error,
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Store directory.
    pub path: PathBuf,

    /// Suffix of value files, e.g. `.json`.
    pub extension: String,

    /// Reaction to log changes made outside this handle.
    pub staleness: StalenessPolicy,

    /// Key to filename mapping.
    pub sanitizer: Arc<dyn KeySanitizer>,

    /// Fsync the directory after each rename.
    pub sync_directory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            extension: JSON_EXT.to_string(),
            staleness: StalenessPolicy::default(),
            sanitizer: Arc::new(DefaultSanitizer),
            sync_directory: true,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            extension: extension.into(),
            ..Default::default()
        }
    }

    pub fn with_staleness(mut self, staleness: StalenessPolicy) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn KeySanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_sync_directory(mut self, sync_directory: bool) -> Self {
        self.sync_directory = sync_directory;
        self
    }

    fn validate(&self) -> Result<()> {
        let ext = &self.extension;
        // A `.new` value file would alias another key's temporary
        if ext.len() < 2
            || !ext.starts_with('.')
            || ext.contains(['/', '\\'])
            || ext.ends_with(NEW_EXT)
        {
            return Err(StoreError::InvalidExtension(ext.clone()));
        }
        Ok(())
    }
}

/// In-memory log plus the on-disk version it was last synced with.
struct LogState {
    log: MutationLog,
    fingerprint: Option<Fingerprint>,
}

/// A key-value store over one directory.
///
/// Values live in one file per key; the mutation log is the only record
/// of which keys exist and when they changed.
///
/// Writes to the same value file are serialized, so concurrent `set` calls
/// on one key all succeed and the last rename wins. They are not serialized
/// across the value write and the log update: two writers with different
/// content can both pass the hash check, and the log may then record the
/// hash of the other writer's content until the next `set`.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Value files.
    values: ValueStorage,

    /// Log file on disk.
    log_file: LogFile,

    /// Log state; every read and write of the log goes through this lock.
    state: Mutex<LogState>,
}

impl Store {
    /// Connect to a store directory with default settings.
    pub fn connect(path: impl Into<PathBuf>, extension: impl Into<String>) -> Result<Self> {
        Self::open(StoreConfig::new(path, extension))
    }

    /// Open a store, creating the directory if missing.
    ///
    /// A missing log file means an empty store. A log file that fails to
    /// decode is an error: the store never opens on a partially trusted log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let values = ValueStorage::new(
            &config.path,
            config.extension.clone(),
            Arc::clone(&config.sanitizer),
            config.sync_directory,
        )?;
        let log_file = LogFile::new(&config.path, config.sync_directory);
        let (records, fingerprint) = log_file.load()?;

        info!(
            path = %config.path.display(),
            records = records.len(),
            "opened store"
        );

        Ok(Self {
            config,
            values,
            log_file,
            state: Mutex::new(LogState {
                log: MutationLog::from_records(records),
                fingerprint,
            }),
        })
    }

    // --- Value Operations ---

    /// Open the value file for `key`.
    ///
    /// Reads the filesystem directly; `None` means the file is absent,
    /// whatever the log says.
    pub fn get(&self, key: &str) -> Result<Option<File>> {
        self.values.get(key)
    }

    /// Read the whole value for `key`.
    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.get(key)? {
            Some(mut file) => {
                let mut content = Vec::new();
                file.read_to_end(&mut content)?;
                Ok(Some(content))
            }
            None => Ok(None),
        }
    }

    /// Store `content` under `key`.
    ///
    /// The content is read once, hashed and buffered together. If the hash
    /// matches the key's current hash nothing is written. Otherwise the value
    /// file is replaced first and the log second, so a failed value write
    /// never leaves a log record behind.
    pub fn set(&self, key: &str, content: impl Read) -> Result<()> {
        self.check_key(key)?;

        let (hash, content) = Hash::from_reader_buffered(content)?;

        {
            let mut state = self.state.lock();
            self.sync_with_disk(&mut state)?;
            if state.log.current_hash(key) == Some(hash) {
                debug!(key, "value unchanged, skipping write");
                return Ok(());
            }
        }

        self.values.put(key, &content)?;

        let mutation = self.mutate_log(|log| log.record_set(key, hash, Timestamp::now()))?;
        debug!(key, ?mutation, bytes = content.len(), "set value");
        Ok(())
    }

    /// Store raw bytes under `key`.
    pub fn set_bytes(&self, key: &str, content: &[u8]) -> Result<()> {
        self.set(key, content)
    }

    /// Serialize `value` as JSON and store it under `key`.
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_vec(value)?;
        self.set(key, &content[..])
    }

    /// Read and deserialize the JSON value under `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let file = self
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        serde_json::from_reader(file)
            .map_err(|e| StoreError::Deserialization(format!("{key}: {e}")))
    }

    /// Remove `key`. Returns false if it was not live.
    pub fn cut(&self, key: &str) -> Result<bool> {
        self.check_key(key)?;

        {
            let mut state = self.state.lock();
            self.sync_with_disk(&mut state)?;
            if !state.log.has(key) {
                return Ok(false);
            }
        }

        self.values.delete(key)?;

        let cut = self.mutate_log(|log| log.record_cut(key, Timestamp::now()))?;
        debug!(key, cut, "cut value");
        Ok(cut)
    }

    // --- Log Queries ---

    /// Whether `key` is live.
    pub fn has(&self, key: &str) -> bool {
        self.state.lock().log.has(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.state.lock().log.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys.
    pub fn keys(&self) -> BTreeSet<String> {
        self.state.lock().log.live_keys()
    }

    /// Live keys created at or after `ts` (unix seconds).
    pub fn created_after(&self, ts: i64) -> BTreeSet<String> {
        self.state.lock().log.created_after(Timestamp(ts))
    }

    /// Live keys updated at or after `ts`.
    pub fn updated_after(&self, ts: i64) -> BTreeSet<String> {
        self.state.lock().log.updated_after(Timestamp(ts))
    }

    /// Live keys created or updated at or after `ts`.
    pub fn created_or_updated_after(&self, ts: i64) -> BTreeSet<String> {
        self.state.lock().log.created_or_updated_after(Timestamp(ts))
    }

    /// Keys with a record of one of `types` at or after `ts`, with the type
    /// of the latest such record. Cut keys are included when `types`
    /// contains [`MutationType::Cut`].
    pub fn since(&self, ts: i64, types: &[MutationType]) -> BTreeMap<String, MutationType> {
        self.state.lock().log.since(Timestamp(ts), types)
    }

    /// True if `key` was last changed by an update at or after `ts`.
    pub fn is_updated_after(&self, key: &str, ts: i64) -> bool {
        self.state.lock().log.is_updated_after(key, Timestamp(ts))
    }

    /// Timestamp of the latest log record for `key`, or
    /// [`UNKNOWN_MOD_TIME`](crate::UNKNOWN_MOD_TIME).
    pub fn log_mod_time(&self, key: &str) -> i64 {
        self.state.lock().log.key_mod_time(key)
    }

    /// Timestamp of the latest log record, or
    /// [`UNKNOWN_MOD_TIME`](crate::UNKNOWN_MOD_TIME) for an empty log.
    pub fn mod_time(&self) -> i64 {
        self.state.lock().log.mod_time()
    }

    /// Filesystem modification time of the value file for `key`.
    ///
    /// Can be unknown for a live key after a crash or while a first `set`
    /// is between its hash check and its file write.
    pub fn file_mod_time(&self, key: &str) -> Result<i64> {
        self.values.mod_time(key)
    }

    /// Filesystem modification time of the log file.
    pub fn log_file_mod_time(&self) -> Result<i64> {
        self.log_file.mod_time()
    }

    /// Snapshot of the log records.
    pub fn records(&self) -> Vec<LogRecord> {
        self.state.lock().log.records().to_vec()
    }

    // --- Maintenance ---

    /// Reload the log if the file changed since this handle last saw it.
    ///
    /// Returns whether a reload happened. Works under every policy.
    pub fn refresh(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let current = self.log_file.fingerprint()?;
        if current == state.fingerprint {
            return Ok(false);
        }
        self.reload(&mut state)?;
        Ok(true)
    }

    /// Live keys whose value file is missing. With `fix`, each is cut.
    pub fn vet_log_only(&self, fix: bool) -> Result<Vec<String>> {
        let missing: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| !self.values.exists(key))
            .collect();

        if fix {
            for key in &missing {
                warn!(key = %key, "cutting key without value file");
                self.mutate_log(|log| log.record_cut(key, Timestamp::now()))?;
            }
        }

        Ok(missing)
    }

    /// Stems of value files that belong to no live key. With `fix`, each
    /// file is recorded by setting it from its own content.
    ///
    /// A fixed file is recorded under the key the sanitizer restores from its
    /// stem, or under the stem itself when the sanitizer is not reversible.
    /// Files whose stem no key maps back to are reported but left alone.
    pub fn vet_files_missing(&self, fix: bool) -> Result<Vec<String>> {
        let known: BTreeSet<String> = self
            .keys()
            .iter()
            .map(|key| self.config.sanitizer.sanitize(key))
            .collect();
        let reserved = self.reserved_paths();

        let mut missing = Vec::new();
        for stem in self.values.list_stems()? {
            if known.contains(&stem) {
                continue;
            }
            let mut name = stem.clone();
            name.push_str(self.values.extension());
            if reserved.contains(&self.config.path.join(name)) {
                continue;
            }
            missing.push(stem);
        }

        if fix {
            for stem in &missing {
                let key = self
                    .config
                    .sanitizer
                    .restore(stem)
                    .unwrap_or_else(|| stem.clone());
                if self.config.sanitizer.sanitize(&key) != *stem {
                    warn!(stem = %stem, "no key maps to value file, leaving it");
                    continue;
                }
                if let Some(file) = self.values.get(&key)? {
                    warn!(key = %key, "recording value file missing from log");
                    self.set(&key, file)?;
                }
            }
        }

        Ok(missing)
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Value file extension.
    pub fn extension(&self) -> &str {
        self.values.extension()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Private Helpers ---

    /// Apply `f` to a copy of the log and persist it.
    ///
    /// The in-memory log only changes once the rewrite succeeded. Nothing is
    /// written when the outcome of `f` reports no change.
    fn mutate_log<T: LogChange>(&self, f: impl FnOnce(&mut MutationLog) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let _lock = self.log_file.lock()?;
        self.sync_with_disk(&mut state)?;

        let mut next = state.log.clone();
        let outcome = f(&mut next);
        if !outcome.changed() {
            return Ok(outcome);
        }

        debug_assert!(next.check_compaction().is_ok());

        let fingerprint = self.log_file.write(next.records())?;
        state.log = next;
        state.fingerprint = fingerprint;

        Ok(outcome)
    }

    /// Apply the staleness policy if the log file changed underneath us.
    fn sync_with_disk(&self, state: &mut LogState) -> Result<()> {
        if self.config.staleness == StalenessPolicy::Ignore {
            return Ok(());
        }

        let current = self.log_file.fingerprint()?;
        if current == state.fingerprint {
            return Ok(());
        }

        match self.config.staleness {
            StalenessPolicy::Reload => self.reload(state),
            StalenessPolicy::Error => Err(StoreError::StaleLog {
                loaded: describe(state.fingerprint),
                current: describe(current),
            }),
            StalenessPolicy::Ignore => Ok(()),
        }
    }

    fn reload(&self, state: &mut LogState) -> Result<()> {
        let (records, fingerprint) = self.log_file.load()?;
        warn!(
            path = %self.log_file.path().display(),
            records = records.len(),
            "log changed on disk, reloaded"
        );
        state.log = MutationLog::from_records(records);
        state.fingerprint = fingerprint;
        Ok(())
    }

    /// Files the store itself owns inside its directory.
    fn reserved_paths(&self) -> [PathBuf; 4] {
        let log = self.log_file.path();
        [
            log.to_path_buf(),
            atomic::new_path(log),
            self.log_file.lock_path().to_path_buf(),
            self.config.path.join(LEGACY_INDEX_FILENAME),
        ]
    }

    fn check_key(&self, key: &str) -> Result<()> {
        let path = self.values.value_path(key);
        if self.reserved_paths().contains(&path) {
            return Err(StoreError::InvalidOperation(format!(
                "key {key:?} collides with store file {}",
                path.display()
            )));
        }
        Ok(())
    }
}

fn describe(fingerprint: Option<Fingerprint>) -> String {
    fingerprint.map_or_else(|| "absent".to_string(), |fp| fp.to_string())
}

/// Outcome of a log mutation that says whether the log changed.
trait LogChange {
    fn changed(&self) -> bool;
}

impl LogChange for bool {
    fn changed(&self) -> bool {
        *self
    }
}

impl LogChange for Option<MutationType> {
    fn changed(&self) -> bool {
        self.is_some()
    }
}
