//! # logkv
//!
//! An embedded key-value store over a single local directory.
//!
//! ## Core Concepts
//!
//! - **Values**: One file per key, replaced atomically (write `.new`, fsync, rename)
//! - **Mutation log**: Create/update/cut records, compacted per key and
//!   rewritten atomically on every change; the log is the index
//! - **Content hashes**: SHA-256 of each value, so writing the same content
//!   twice is a no-op
//! - **Temporal queries**: Created/updated-since answered by folding the log
//!
//! ## Example
//!
//! ```ignore
//! use logkv::{Store, JSON_EXT};
//!
//! let store = Store::connect("./my-store", JSON_EXT)?;
//!
//! store.set("quake", &b"{\"year\":1996}"[..])?;
//! assert!(store.has("quake"));
//!
//! let recent = store.created_after(1_700_000_000);
//! store.cut("quake")?;
//! ```

pub mod atomic;
pub mod error;
pub mod migrate;
pub mod records;
pub mod sanitize;
pub mod store;
pub mod types;
pub mod values;

// Re-exports
pub use error::{Result, StoreError};
pub use migrate::{migrate, migrate_dir, LegacySource, MigrationReport};
pub use records::{LogFile, MutationLog, LOG_FILENAME};
pub use sanitize::{DefaultSanitizer, KeySanitizer};
pub use store::{StalenessPolicy, Store, StoreConfig, GOB_EXT, HTML_EXT, JSON_EXT, XML_EXT};
pub use types::*;
pub use values::ValueStorage;
