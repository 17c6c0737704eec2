//! Integration tests for the key-value store.

use logkv::{
    LogRecord, MutationType, Store, StoreConfig, Timestamp, JSON_EXT, LOG_FILENAME,
};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> Store {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Store::open(StoreConfig::new(dir.path().join("store"), JSON_EXT).with_sync_directory(false))
        .unwrap()
}

fn records_for(store: &Store, key: &str) -> Vec<LogRecord> {
    store.records().into_iter().filter(|r| r.id == key).collect()
}

// --- Realistic Workflow Tests ---

#[test]
fn test_catalog_workflow() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let games = [
        ("quake", r#"{"title":"Quake","year":1996}"#),
        ("doom", r#"{"title":"Doom","year":1993}"#),
        ("thief", r#"{"title":"Thief","year":1998}"#),
    ];
    for (key, value) in games {
        store.set(key, value.as_bytes()).unwrap();
    }

    assert_eq!(store.len(), 3);
    let keys: BTreeSet<String> = games.iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(store.keys(), keys);

    // Streaming read
    let mut content = String::new();
    store
        .get("doom")
        .unwrap()
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, games[1].1);

    // Update one, cut another
    store
        .set("quake", &br#"{"title":"Quake","year":1996,"rating":5}"#[..])
        .unwrap();
    assert!(store.cut("thief").unwrap());

    assert_eq!(store.len(), 2);
    assert!(!store.has("thief"));
    assert!(store.get("thief").unwrap().is_none());
    assert!(store.updated_after(0).contains("quake"));
    assert!(!store.created_after(0).contains("thief"));
}

// --- Compaction Properties ---

#[test]
fn test_idempotent_set_keeps_single_record() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("k", b"content").unwrap();
    let value_path = store.path().join("k.json");
    let file_modified = fs::metadata(&value_path).unwrap().modified().unwrap();
    let log_len = store.records().len();

    store.set_bytes("k", b"content").unwrap();

    assert_eq!(store.records().len(), log_len);
    assert_eq!(records_for(&store, "k").len(), 1);
    assert_eq!(
        fs::metadata(&value_path).unwrap().modified().unwrap(),
        file_modified
    );
}

#[test]
fn test_compaction_bound() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    for i in 0..50 {
        store.set_bytes("k", format!("content {i}").as_bytes()).unwrap();
        store.set_bytes("other", b"stable").unwrap();
    }

    let records = records_for(&store, "k");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].mutation, MutationType::Create);
    assert_eq!(records[1].mutation, MutationType::Update);
    assert_eq!(records_for(&store, "other").len(), 1);
    assert_eq!(store.records().len(), 3);
}

#[test]
fn test_cut_compaction() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("k", b"1").unwrap();
    store.set_bytes("k", b"2").unwrap();
    assert!(store.cut("k").unwrap());

    let records = records_for(&store, "k");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].mutation, MutationType::Cut);
    assert!(records[0].hash.is_none());
    assert!(!store.has("k"));
    assert_eq!(store.len(), 0);
}

#[test]
fn test_set_after_cut_recreates_key() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("k", b"1").unwrap();
    store.cut("k").unwrap();
    store.set_bytes("k", b"1").unwrap();

    let records = records_for(&store, "k");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].mutation, MutationType::Create);
    assert_eq!(store.get_bytes("k").unwrap().unwrap(), b"1");
}

// --- Temporal Queries ---

#[test]
fn test_temporal_queries_on_fixed_log() {
    let dir = TempDir::new().unwrap();
    let store_dir = dir.path().join("store");
    fs::create_dir_all(&store_dir).unwrap();

    let hash = |s: &str| logkv::Hash::from_bytes(s.as_bytes());
    let records = vec![
        LogRecord::create("1", hash("a"), Timestamp(1)),
        LogRecord::create("2", hash("b"), Timestamp(2)),
        LogRecord::update("2", hash("c"), Timestamp(3)),
        LogRecord::create("3", hash("d"), Timestamp(4)),
        LogRecord::cut("1", Timestamp(5)),
    ];
    fs::write(
        store_dir.join(LOG_FILENAME),
        logkv::records::encode(&records).unwrap(),
    )
    .unwrap();

    let store = Store::connect(&store_dir, JSON_EXT).unwrap();
    let set = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>();

    assert_eq!(store.created_after(3), set(&["3"]));
    assert_eq!(store.updated_after(3), set(&["2"]));
    assert_eq!(store.created_or_updated_after(4), set(&["3"]));

    let created = store.since(0, &[MutationType::Create]);
    assert_eq!(created.keys().cloned().collect::<BTreeSet<_>>(), set(&["1", "2", "3"]));

    let changed = store.since(3, &[MutationType::Update, MutationType::Cut]);
    assert_eq!(changed.len(), 2);
    assert_eq!(changed["2"], MutationType::Update);
    assert_eq!(changed["1"], MutationType::Cut);

    assert_eq!(store.log_mod_time("2"), 3);
    assert_eq!(store.mod_time(), 5);
    assert!(store.is_updated_after("2", 2));
    assert_eq!(store.keys(), set(&["2", "3"]));
}

#[test]
fn test_created_after_now() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let before = Timestamp::now().0;

    store.set_bytes("fresh", b"x").unwrap();

    assert!(store.created_after(before).contains("fresh"));
    assert!(store.created_after(before + 3600).is_empty());
    assert!(store.updated_after(before).is_empty());
}

// --- Crash Safety ---

#[test]
fn test_stray_new_files_are_overwritten() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("k", b"original").unwrap();
    let records = store.records();

    // A crash between writing .new and renaming leaves these behind
    let value_new = store.path().join("k.json.new");
    let log_new = store.path().join(format!("{LOG_FILENAME}.new"));
    fs::write(&value_new, b"half-writ").unwrap();
    fs::write(&log_new, b"\x00\x01garbage").unwrap();

    // Nothing reads the leftovers
    drop(store);
    let store = test_store(&dir);
    assert_eq!(store.records(), records);
    assert_eq!(store.get_bytes("k").unwrap().unwrap(), b"original");

    store.set_bytes("k", b"replacement").unwrap();

    assert!(!value_new.exists());
    assert!(!log_new.exists());
    assert_eq!(store.get_bytes("k").unwrap().unwrap(), b"replacement");
}

#[test]
fn test_missing_value_file_tolerated() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("k", b"v").unwrap();
    fs::remove_file(store.path().join("k.json")).unwrap();

    assert!(store.has("k"));
    assert!(store.get("k").unwrap().is_none());
    assert_eq!(store.file_mod_time("k").unwrap(), logkv::UNKNOWN_MOD_TIME);

    // Cut still succeeds when the file is already gone
    assert!(store.cut("k").unwrap());
}

// --- Vetting ---

#[test]
fn test_vet_log_only() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("kept", b"1").unwrap();
    store.set_bytes("lost", b"2").unwrap();
    fs::remove_file(store.path().join("lost.json")).unwrap();

    assert_eq!(store.vet_log_only(false).unwrap(), vec!["lost"]);
    assert!(store.has("lost"));

    assert_eq!(store.vet_log_only(true).unwrap(), vec!["lost"]);
    assert!(!store.has("lost"));
    assert!(store.vet_log_only(false).unwrap().is_empty());
}

#[test]
fn test_vet_files_missing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.set_bytes("known", b"1").unwrap();
    fs::write(store.path().join("stray.json"), b"found").unwrap();
    fs::write(store.path().join("other.html"), b"ignored").unwrap();

    assert_eq!(store.vet_files_missing(false).unwrap(), vec!["stray"]);
    assert!(!store.has("stray"));

    assert_eq!(store.vet_files_missing(true).unwrap(), vec!["stray"]);
    assert!(store.has("stray"));
    assert_eq!(store.get_bytes("stray").unwrap().unwrap(), b"found");
    assert!(store.vet_files_missing(false).unwrap().is_empty());
}

#[test]
fn test_vet_files_missing_reports_underscore_keys() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(
        StoreConfig::new(dir.path().join("store"), ".msgpack").with_sync_directory(false),
    )
    .unwrap();

    store.set_bytes("known", b"1").unwrap();
    for stem in ["%", "%5Fhidden", "_raw"] {
        fs::write(store.path().join(format!("{stem}.msgpack")), stem).unwrap();
    }

    // The log itself carries the extension but is not a value
    assert!(store.path().join(LOG_FILENAME).exists());
    assert_eq!(
        store.vet_files_missing(false).unwrap(),
        vec!["%", "%5Fhidden", "_raw"]
    );

    store.vet_files_missing(true).unwrap();
    assert!(store.has(""));
    assert!(store.has("_hidden"));
    assert_eq!(store.get_bytes("_hidden").unwrap().unwrap(), b"%5Fhidden");

    // No key sanitizes to a bare leading underscore, so that file stays out
    assert!(!store.has("_raw"));
    assert_eq!(store.vet_files_missing(false).unwrap(), vec!["_raw"]);
}
