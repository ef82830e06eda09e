//! Sandboxed writes into the generated project's workspace.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::sanitize::{PathRejection, display_relative, normalize_relative};
use crate::io::atomic::{is_temp_file, write_atomic};

/// Relative path -> full file content.
pub type FileMap = BTreeMap<String, String>;

/// Files larger than this are never sent back to the generator.
pub const MAX_FILE_BYTES: u64 = 512 * 1024;

/// A file the writer refused to place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub path: String,
    pub reason: PathRejection,
}

/// Outcome of one [`WorkspaceWriter::apply`] batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Normalized relative paths, in map order.
    pub written: Vec<String>,
    pub rejected: Vec<Rejection>,
}

/// Writes generator output under a fixed root and nowhere else.
#[derive(Debug, Clone)]
pub struct WorkspaceWriter {
    root: PathBuf,
}

impl WorkspaceWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write every acceptable entry of `files`, replacing whole files.
    ///
    /// Unsafe paths are recorded in the report and skipped; only I/O failures
    /// on accepted paths are errors.
    pub fn apply(&self, files: &FileMap) -> Result<ApplyReport> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create workspace {}", self.root.display()))?;
        let canonical_root = self
            .root
            .canonicalize()
            .with_context(|| format!("canonicalize workspace {}", self.root.display()))?;

        let mut report = ApplyReport::default();
        for (raw, content) in files {
            let (relative, dest) = match resolve(&canonical_root, raw) {
                Ok(resolved) => resolved,
                Err(reason) => {
                    warn!(path = %raw, reason = %reason, "rejected workspace path");
                    report.rejected.push(Rejection {
                        path: raw.clone(),
                        reason,
                    });
                    continue;
                }
            };
            write_atomic(&dest, content.as_bytes())
                .with_context(|| format!("write workspace file {relative}"))?;
            debug!(path = %relative, bytes = content.len(), "wrote workspace file");
            report.written.push(relative);
        }

        info!(
            written = report.written.len(),
            rejected = report.rejected.len(),
            "applied generated files"
        );
        Ok(report)
    }
}

/// Map `raw` to a destination strictly inside `canonical_root`.
fn resolve(canonical_root: &Path, raw: &str) -> Result<(String, PathBuf), PathRejection> {
    let relative = normalize_relative(raw)?;
    let dest = canonical_root.join(&relative);

    // Symlinked directories are resolved through the deepest ancestor that exists.
    let mut ancestor = dest.parent();
    while let Some(dir) = ancestor {
        if fs::symlink_metadata(dir).is_ok() {
            break;
        }
        ancestor = dir.parent();
    }
    let ancestor = ancestor.ok_or(PathRejection::OutsideRoot)?;
    let resolved = ancestor
        .canonicalize()
        .map_err(|_| PathRejection::OutsideRoot)?;
    if !resolved.starts_with(canonical_root) {
        return Err(PathRejection::OutsideRoot);
    }
    if !resolved.is_dir() {
        return Err(PathRejection::ParentIsFile);
    }

    if fs::symlink_metadata(&dest).is_ok() {
        let existing = dest.canonicalize().map_err(|_| PathRejection::OutsideRoot)?;
        if existing == canonical_root || !existing.starts_with(canonical_root) {
            return Err(PathRejection::OutsideRoot);
        }
        if existing.is_dir() {
            return Err(PathRejection::IsDirectory);
        }
    }

    Ok((display_relative(&relative), dest))
}

/// Snapshot the workspace as text, for patch requests.
///
/// Symlinks are not followed. Non-UTF-8 files, files over [`MAX_FILE_BYTES`]
/// and in-flight temp files are skipped. A missing workspace is empty.
pub fn read_workspace_files(root: &Path) -> Result<FileMap> {
    let mut files = FileMap::new();
    if !root.is_dir() {
        return Ok(files);
    }
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk workspace {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_temp_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(u64::MAX);
        if size > MAX_FILE_BYTES {
            debug!(path = %entry.path().display(), size, "skipping oversized workspace file");
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        match fs::read(entry.path()).map(String::from_utf8) {
            Ok(Ok(text)) => {
                files.insert(display_relative(relative), text);
            }
            Ok(Err(_)) => debug!(path = %relative.display(), "skipping non-UTF-8 workspace file"),
            Err(err) => warn!(path = %relative.display(), err = %err, "unreadable workspace file"),
        }
    }
    Ok(files)
}

/// Remove and recreate the workspace for a fresh run.
///
/// Refuses the filesystem root, the user's home directory and any directory
/// containing `state_path`.
pub fn clear_workspace(root: &Path, state_path: &Path) -> Result<()> {
    let absolute = absolute(root)?;
    if absolute.parent().is_none() {
        return Err(anyhow!("refusing to clear filesystem root {}", absolute.display()));
    }
    if let Some(home) = dirs::home_dir()
        && absolute == absolute_or_self(&home)
    {
        return Err(anyhow!("refusing to clear home directory {}", absolute.display()));
    }
    if absolute_or_self(state_path).starts_with(&absolute) {
        return Err(anyhow!(
            "refusing to clear {}: it contains the state document {}",
            absolute.display(),
            state_path.display()
        ));
    }

    if absolute.is_dir() {
        fs::remove_dir_all(&absolute)
            .with_context(|| format!("remove workspace {}", absolute.display()))?;
    }
    fs::create_dir_all(&absolute)
        .with_context(|| format!("create workspace {}", absolute.display()))?;
    info!(workspace = %absolute.display(), "cleared workspace");
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))
}

fn absolute_or_self(path: &Path) -> PathBuf {
    absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
