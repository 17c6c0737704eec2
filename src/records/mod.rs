//! Mutation log implementation.
//!
//! The log is held in memory, compacted on every mutation and rewritten
//! in full to a single file per store directory.

mod codec;
mod file;
mod log;

pub use codec::{decode, encode};
pub use file::{Fingerprint, LogFile, LogLock, LOCK_FILENAME, LOG_FILENAME};
pub use log::MutationLog;
