//! Lexical path helpers for the project-root write boundary.
//!
//! Everything here is pure: no filesystem access, so symlinks are not
//! resolved. The orchestrator only ever builds paths by joining configured
//! relative directories onto the root, which keeps lexical checks sufficient.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path {path} escapes project root {root}")]
pub struct PathEscape {
    pub root: String,
    pub path: String,
}

/// Collapse `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `candidate` against `root` and reject anything outside it.
///
/// Relative candidates are joined onto `root`; absolute candidates must
/// already live below it.
pub fn ensure_within(root: &Path, candidate: &Path) -> Result<PathBuf, PathEscape> {
    let root_norm = normalize(root);
    let joined = if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&root_norm.join(candidate))
    };
    if joined.starts_with(&root_norm) && !joined.components().any(|c| c == Component::ParentDir) {
        Ok(joined)
    } else {
        Err(PathEscape {
            root: root.display().to_string(),
            path: candidate.display().to_string(),
        })
    }
}

/// Render `path` relative to `root` with `/` separators (for state keys and reports).
pub fn relative_key(root: &Path, path: &Path) -> String {
    let root_norm = normalize(root);
    let path_norm = normalize(path);
    let rel = path_norm.strip_prefix(&root_norm).unwrap_or(&path_norm);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a test file name to the source file name it exercises.
///
/// `test_parser.py` with prefix `test_` maps to `parser.py`. Returns `None`
/// when the name does not carry the prefix or nothing is left after it.
pub fn source_name_for_test(test_file_name: &str, prefix: &str) -> Option<String> {
    let rest = test_file_name.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('.') {
        return None;
    }
    Some(rest.to_string())
}
