//! Per-key value files.
//!
//! Each live key owns one file named `sanitize(key) + extension` in the
//! store directory, holding the raw value bytes.

mod storage;

pub use storage::ValueStorage;
