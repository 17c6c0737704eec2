//! In-memory mutation log with per-key compaction.
//!
//! For any key the log holds either one `Create` and at most one `Update`,
//! or a single `Cut` tombstone. Every mutation goes through [`MutationLog::append`],
//! which drops superseded records before pushing the new one, so the log
//! grows with the number of distinct keys rather than the number of writes.

use crate::types::{Hash, LogRecord, MutationType, Timestamp, UNKNOWN_MOD_TIME};
use std::collections::{BTreeMap, BTreeSet};

/// Chronological, compacted list of log records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationLog {
    records: Vec<LogRecord>,
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap records as read from disk. No compaction is applied.
    pub fn from_records(records: Vec<LogRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Number of records (not keys).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // --- Mutations ---

    /// Record that `key` now holds content with `hash`.
    ///
    /// Returns the mutation recorded, or `None` when `hash` already matches
    /// the key's current hash.
    pub fn record_set(&mut self, key: &str, hash: Hash, ts: Timestamp) -> Option<MutationType> {
        if self.current_hash(key) == Some(hash) {
            return None;
        }
        let record = if self.has(key) {
            LogRecord::update(key, hash, ts)
        } else {
            LogRecord::create(key, hash, ts)
        };
        let mutation = record.mutation;
        self.append(record);
        Some(mutation)
    }

    /// Record that `key` was cut. Returns false if it was not live.
    pub fn record_cut(&mut self, key: &str, ts: Timestamp) -> bool {
        self.append(LogRecord::cut(key, ts))
    }

    /// Append a record, compacting the key's earlier records first.
    ///
    /// - `Create` on a live key is recorded as an `Update`.
    /// - `Update` on a non-live key is recorded as a `Create`.
    /// - `Update` drops the key's previous `Update`; its `Create` is kept.
    /// - `Create` drops any tombstone for the key.
    /// - `Cut` drops every record for the key. A cut of a non-live key is
    ///   ignored and returns false.
    pub fn append(&mut self, mut record: LogRecord) -> bool {
        let live = self.has(&record.id);

        match record.mutation {
            MutationType::Create | MutationType::Update => {
                if live {
                    record.mutation = MutationType::Update;
                    self.records
                        .retain(|r| !(r.id == record.id && r.mutation == MutationType::Update));
                } else {
                    record.mutation = MutationType::Create;
                    self.records.retain(|r| r.id != record.id);
                }
            }
            MutationType::Cut => {
                if !live {
                    return false;
                }
                record.hash = None;
                self.records.retain(|r| r.id != record.id);
            }
        }

        self.records.push(record);
        true
    }

    // --- Queries ---

    /// Most recent record for `key`.
    pub fn last_record(&self, key: &str) -> Option<&LogRecord> {
        self.records.iter().rev().find(|r| r.id == key)
    }

    /// Whether `key` is live (its latest record is not a tombstone).
    pub fn has(&self, key: &str) -> bool {
        self.last_record(key).map_or(false, LogRecord::is_live)
    }

    /// Hash of the latest record for `key`; tombstones yield `None`.
    pub fn current_hash(&self, key: &str) -> Option<Hash> {
        self.last_record(key).and_then(|r| r.hash)
    }

    /// All live keys.
    pub fn live_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for record in &self.records {
            match record.mutation {
                MutationType::Create | MutationType::Update => {
                    keys.insert(record.id.clone());
                }
                MutationType::Cut => {
                    keys.remove(&record.id);
                }
            }
        }
        keys
    }

    /// Number of live keys.
    pub fn live_count(&self) -> usize {
        self.live_keys().len()
    }

    /// Live keys created at or after `ts`.
    pub fn created_after(&self, ts: Timestamp) -> BTreeSet<String> {
        self.filter_live(|r| r.mutation == MutationType::Create && r.timestamp >= ts)
    }

    /// Live keys updated at or after `ts`.
    pub fn updated_after(&self, ts: Timestamp) -> BTreeSet<String> {
        self.filter_live(|r| r.mutation == MutationType::Update && r.timestamp >= ts)
    }

    /// Live keys created or updated at or after `ts`.
    pub fn created_or_updated_after(&self, ts: Timestamp) -> BTreeSet<String> {
        self.filter_live(|r| r.is_live() && r.timestamp >= ts)
    }

    /// Keys with a record of one of `types` at or after `ts`, mapped to the
    /// type of the latest such record. Tombstones are not applied.
    pub fn since(&self, ts: Timestamp, types: &[MutationType]) -> BTreeMap<String, MutationType> {
        let mut matches = BTreeMap::new();
        for record in &self.records {
            if record.timestamp >= ts && types.contains(&record.mutation) {
                matches.insert(record.id.clone(), record.mutation);
            }
        }
        matches
    }

    /// True if the latest record for `key` is an update at or after `ts`.
    pub fn is_updated_after(&self, key: &str, ts: Timestamp) -> bool {
        match self.last_record(key) {
            Some(r) if r.mutation == MutationType::Update => r.timestamp >= ts,
            _ => false,
        }
    }

    /// Timestamp of the latest record for `key`, or [`UNKNOWN_MOD_TIME`].
    pub fn key_mod_time(&self, key: &str) -> i64 {
        self.last_record(key)
            .map_or(UNKNOWN_MOD_TIME, |r| r.timestamp.0)
    }

    /// Timestamp of the last record in the log, or [`UNKNOWN_MOD_TIME`].
    pub fn mod_time(&self) -> i64 {
        self.records.last().map_or(UNKNOWN_MOD_TIME, |r| r.timestamp.0)
    }

    /// Check the per-key compaction invariant.
    ///
    /// Returns a description of the first violation found.
    pub fn check_compaction(&self) -> Result<(), String> {
        let mut counts: BTreeMap<&str, [usize; 3]> = BTreeMap::new();
        for record in &self.records {
            let slot = match record.mutation {
                MutationType::Create => 0,
                MutationType::Update => 1,
                MutationType::Cut => 2,
            };
            counts.entry(record.id.as_str()).or_default()[slot] += 1;
        }

        for (key, [creates, updates, cuts]) in counts {
            let live_ok = creates == 1 && updates <= 1 && cuts == 0;
            let cut_ok = creates == 0 && updates == 0 && cuts == 1;
            if !live_ok && !cut_ok {
                return Err(format!(
                    "key {key:?}: {creates} create, {updates} update, {cuts} cut records"
                ));
            }
        }
        Ok(())
    }

    /// Keep only records matching `m`, dropping any key that is later cut.
    fn filter_live(&self, m: impl Fn(&LogRecord) -> bool) -> BTreeSet<String> {
        let mut matches = BTreeSet::new();
        for record in &self.records {
            if m(record) {
                matches.insert(record.id.clone());
            }
            if record.mutation == MutationType::Cut {
                matches.remove(&record.id);
            }
        }
        matches
    }
}
