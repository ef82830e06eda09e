//! Crash-safe whole-file replacement.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::Builder;
use tracing::debug;

/// Prefix of in-flight temp files; readers of a directory skip these.
pub const TEMP_PREFIX: &str = ".repairloop-";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Atomically replace `path` with `contents`.
///
/// The bytes go to a temp file in the same directory, which is flushed and
/// fsynced before being renamed over the target. Readers observe either the
/// previous file or the complete new one. If anything fails before the rename
/// the temp file is removed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut tmp = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.flush()
        .with_context(|| format!("flush temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("fsync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;

    sync_dir(parent);
    debug!(path = %path.display(), bytes = contents.len(), "atomic write complete");
    Ok(())
}

/// Serialize `value` to pretty JSON with a trailing newline and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Whether a directory entry is one of our in-flight temp files.
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

// Persist the rename itself. Best effort: some filesystems refuse to fsync a
// directory handle.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir)
        && let Err(err) = handle.sync_all()
    {
        debug!(dir = %dir.display(), err = %err, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
