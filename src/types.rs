//! Core types for the key-value store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returned by mod-time queries when nothing is known about a key or file.
pub const UNKNOWN_MOD_TIME: i64 = -1;

/// Content hash for values (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Drain a reader once, hashing and buffering its bytes in the same pass.
    pub fn from_reader_buffered(mut reader: impl Read) -> io::Result<(Self, Vec<u8>)> {
        let mut hasher = Sha256::new();
        let mut content = Vec::new();
        let mut chunk = [0u8; 8192];

        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&chunk[..n]);
            content.extend_from_slice(&chunk[..n]);
        }

        Ok((Hash(hasher.finalize().into()), content))
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Seconds since Unix epoch, UTC.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a filesystem time, clamping pre-epoch values to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Timestamp(secs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of change a log record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationType {
    Create,
    Update,
    Cut,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Cut => "cut",
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the mutation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Key the mutation applies to.
    pub id: String,

    /// When the mutation happened.
    pub timestamp: Timestamp,

    /// What happened.
    pub mutation: MutationType,

    /// Hash of the value written; `None` for cuts.
    pub hash: Option<Hash>,
}

impl LogRecord {
    pub fn create(id: impl Into<String>, hash: Hash, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            timestamp,
            mutation: MutationType::Create,
            hash: Some(hash),
        }
    }

    pub fn update(id: impl Into<String>, hash: Hash, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            timestamp,
            mutation: MutationType::Update,
            hash: Some(hash),
        }
    }

    pub fn cut(id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            timestamp,
            mutation: MutationType::Cut,
            hash: None,
        }
    }

    /// Whether this record marks its key as live.
    pub fn is_live(&self) -> bool {
        self.mutation != MutationType::Cut
    }
}
