//! Write-temp-then-rename file replacement.
//!
//! Content is written to `path + ".new"`, synced, and renamed over `path`.
//! A reader of `path` sees either the previous complete file or the new
//! complete file. A leftover `.new` from an interrupted write is never
//! read back; the next write truncates and reuses it.

use crate::error::Result;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of the temporary file used during an atomic write.
pub const NEW_EXT: &str = ".new";

/// Path of the temporary file for `path`.
pub fn new_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(NEW_EXT);
    PathBuf::from(name)
}

/// Replace `path` with the bytes produced by `content`.
///
/// Errors from any step (create, copy, sync, rename) are returned as is.
/// On error `path` keeps its previous content; at worst a `.new` file is
/// left behind.
pub fn write_atomically(path: &Path, mut content: impl Read, sync_dir: bool) -> Result<()> {
    let tmp_path = new_path(path);

    if tmp_path.exists() {
        debug!(path = %tmp_path.display(), "overwriting leftover temporary file");
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // Not create_new: an existing .new is the remains of a crashed write.
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    io::copy(&mut content, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;

    if sync_dir {
        if let Some(parent) = path.parent() {
            sync_directory(parent)?;
        }
    }

    Ok(())
}

/// Fsync a directory so a completed rename survives power loss.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// NTFS journals metadata; there is no directory handle to sync.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> Result<()> {
    Ok(())
}
