//! One-shot migration from legacy on-disk formats.
//!
//! Two older layouts are understood:
//!
//! - an index file `_index.msgpack` holding a map of key to
//!   `{hash, created, modified}`;
//! - a `_legacy/` directory holding an uncompacted `_log.msgpack` record list
//!   and one hex `.sha256` hash file per key.
//!
//! Both are rewritten into the current log and then deleted. Running the
//! migration again finds nothing and does nothing.

use crate::error::{Result, StoreError};
use crate::records::{LogFile, MutationLog};
use crate::store::StoreConfig;
use crate::types::{Hash, LogRecord, MutationType, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Legacy index file name.
pub const LEGACY_INDEX_FILENAME: &str = "_index.msgpack";

/// Legacy log directory name.
pub const LEGACY_DIRNAME: &str = "_legacy";

/// Legacy log file name inside [`LEGACY_DIRNAME`].
pub const LEGACY_LOG_FILENAME: &str = "_log.msgpack";

/// Suffix of legacy per-key hash files.
pub const LEGACY_HASH_EXT: &str = ".sha256";

/// Entry of the legacy index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyIndexRecord {
    /// Hex SHA-256, empty if unknown.
    pub hash: String,
    pub created: i64,
    pub modified: i64,
}

/// Legacy index: key to record.
pub type LegacyIndex = BTreeMap<String, LegacyIndexRecord>;

/// Entry of the legacy log. Hashes were kept in side files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLogRecord {
    pub id: String,
    pub ts: i64,
    pub mt: MutationType,
}

/// Which legacy layout was migrated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LegacySource {
    Index,
    Log,
}

/// Result of a migration that found something to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    pub source: LegacySource,
    /// Live keys in the migrated log.
    pub keys: usize,
    /// Records in the migrated log.
    pub records: usize,
}

/// Migrate a store directory using the default configuration.
pub fn migrate_dir(dir: impl Into<PathBuf>) -> Result<Option<MigrationReport>> {
    migrate(&StoreConfig {
        path: dir.into(),
        ..Default::default()
    })
}

/// Convert any legacy artifacts in `config.path` into the current log.
///
/// The index is the newer of the two legacy layouts: when both are present
/// only the index is migrated and the legacy log is discarded.
///
/// If a current log already exists the legacy artifacts are leftovers of
/// an interrupted migration: they are deleted without being read.
pub fn migrate(config: &StoreConfig) -> Result<Option<MigrationReport>> {
    let dir = config.path.as_path();
    let log_file = LogFile::new(dir, config.sync_directory);
    let index_path = dir.join(LEGACY_INDEX_FILENAME);
    let legacy_dir = dir.join(LEGACY_DIRNAME);
    let legacy_log_path = legacy_dir.join(LEGACY_LOG_FILENAME);

    let has_index = index_path.is_file();
    let has_legacy_log = legacy_log_path.is_file();

    if !has_index && !has_legacy_log {
        return Ok(None);
    }

    if log_file.path().exists() {
        warn!(path = %dir.display(), "current log present, removing leftover legacy files");
        remove_legacy(&index_path, &legacy_dir)?;
        return Ok(None);
    }

    let (source, log) = if has_index {
        if has_legacy_log {
            warn!(
                path = %legacy_log_path.display(),
                "legacy index takes precedence, discarding legacy log"
            );
        }
        (LegacySource::Index, from_index(&index_path)?)
    } else {
        (
            LegacySource::Log,
            from_legacy_log(&legacy_log_path, &legacy_dir, config)?,
        )
    };

    log_file.write(log.records())?;
    remove_legacy(&index_path, &legacy_dir)?;

    let report = MigrationReport {
        source,
        keys: log.live_count(),
        records: log.len(),
    };
    info!(path = %dir.display(), ?report, "migrated legacy store");

    Ok(Some(report))
}

/// Replay the legacy index as creates and updates in timestamp order.
fn from_index(path: &Path) -> Result<MutationLog> {
    let index: LegacyIndex = rmp_serde::from_slice(&fs::read(path)?)?;

    let mut records = Vec::new();
    for (key, entry) in index {
        let hash = parse_hash(&key, &entry.hash)?;
        records.push((Timestamp(entry.created), key.clone(), MutationType::Create, hash));
        if entry.modified > entry.created {
            records.push((Timestamp(entry.modified), key, MutationType::Update, hash));
        }
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));

    let mut log = MutationLog::new();
    for (timestamp, id, mutation, hash) in records {
        log.append(LogRecord {
            id,
            timestamp,
            mutation,
            hash,
        });
    }
    Ok(log)
}

/// Replay the legacy log through compaction, attaching side-file hashes.
fn from_legacy_log(path: &Path, legacy_dir: &Path, config: &StoreConfig) -> Result<MutationLog> {
    let bytes = fs::read(path)?;
    let legacy: Vec<LegacyLogRecord> = if bytes.is_empty() {
        Vec::new()
    } else {
        rmp_serde::from_slice(&bytes)?
    };

    let mut hashes: BTreeMap<String, Option<Hash>> = BTreeMap::new();
    let mut log = MutationLog::new();

    for record in legacy {
        let hash = match record.mt {
            MutationType::Cut => None,
            _ => match hashes.get(&record.id) {
                Some(hash) => *hash,
                None => {
                    let hash = read_legacy_hash(legacy_dir, &record.id, config)?;
                    hashes.insert(record.id.clone(), hash);
                    hash
                }
            },
        };
        log.append(LogRecord {
            id: record.id,
            timestamp: Timestamp(record.ts),
            mutation: record.mt,
            hash,
        });
    }

    Ok(log)
}

fn read_legacy_hash(legacy_dir: &Path, key: &str, config: &StoreConfig) -> Result<Option<Hash>> {
    let mut name = config.sanitizer.sanitize(key);
    name.push_str(LEGACY_HASH_EXT);

    match fs::read_to_string(legacy_dir.join(name)) {
        Ok(hex) => parse_hash(key, &hex),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_hash(key: &str, hex: &str) -> Result<Option<Hash>> {
    if hex.trim().is_empty() {
        return Ok(None);
    }
    Hash::from_hex(hex)
        .map(Some)
        .map_err(|e| StoreError::Deserialization(format!("legacy hash for {key:?}: {e}")))
}

fn remove_legacy(index_path: &Path, legacy_dir: &Path) -> Result<()> {
    match fs::remove_file(index_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    match fs::remove_dir_all(legacy_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
