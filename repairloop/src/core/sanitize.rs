//! Lexical normalization of collaborator-supplied relative paths.
//!
//! This is the pure half of the workspace sandbox: it never touches the
//! filesystem. [`crate::io::workspace`] layers canonicalization on top to catch
//! symlink escapes.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    NulByte,
    Empty,
    ParentEscape,
    Absolute,
    OutsideRoot,
    IsDirectory,
    ParentIsFile,
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PathRejection::NulByte => "path contains a NUL byte",
            PathRejection::Empty => "path is empty after normalization",
            PathRejection::ParentEscape => "path escapes the workspace via '..'",
            PathRejection::Absolute => "path is absolute",
            PathRejection::OutsideRoot => "path resolves outside the workspace",
            PathRejection::IsDirectory => "destination is a directory",
            PathRejection::ParentIsFile => "a parent component is an existing file",
        };
        f.write_str(msg)
    }
}

/// Normalize `raw` into a relative path with no `.` or `..` components.
///
/// Leading separators and `./` segments are stripped first, so `/etc/x`
/// becomes `etc/x` (inside the workspace) rather than an absolute path.
/// Interior `..` segments collapse against earlier components; any `..` that
/// would climb above the start is rejected.
pub fn normalize_relative(raw: &str) -> Result<PathBuf, PathRejection> {
    if raw.contains('\0') {
        return Err(PathRejection::NulByte);
    }

    let mut rest = raw.trim();
    loop {
        let stripped = rest
            .trim_start_matches(['/', '\\'])
            .trim_start_matches("./");
        if stripped.len() == rest.len() {
            break;
        }
        rest = stripped;
    }

    let unified = rest.replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathRejection::ParentEscape);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(PathRejection::Absolute),
        }
    }

    if parts.is_empty() {
        return Err(PathRejection::Empty);
    }
    // Drive-qualified names ("C:foo") survive component parsing on unix.
    if parts[0].to_string_lossy().contains(':') {
        return Err(PathRejection::Absolute);
    }
    Ok(parts.into_iter().collect())
}

/// Render a normalized relative path with `/` separators.
pub fn display_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
