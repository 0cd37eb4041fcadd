// Workspace path canonicalization: NFKC, `/` separators, no traversal, 512 char max.
//
// Every copy of a project (workspace, cloud store, FileRecord cache) keys files
// by the normalized relative path, so the same file always hashes to the same id.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters.
const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path escapes the workspace root via `{0}`")]
    Traversal(String),

    #[error("path contains a NUL byte")]
    NullByte,

    #[error("path contains an invalid component: {0}")]
    InvalidComponent(String),
}

/// Normalize a workspace-relative file path.
///
/// Separators are unified to `/`, duplicate and leading/trailing separators are
/// dropped, and `.`/`..` components are rejected rather than resolved. Absolute
/// paths are treated as relative to the workspace root.
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let unified: String = input.nfkc().map(|c| if c == '\\' { '/' } else { c }).collect();

    let mut components = Vec::new();
    for component in unified.split('/').filter(|segment| !segment.is_empty()) {
        match component {
            "." | ".." => return Err(PathError::Traversal(component.to_string())),
            _ if component.trim().is_empty() => {
                return Err(PathError::InvalidComponent("(whitespace-only)".to_string()));
            }
            _ => components.push(component),
        }
    }

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    let joined = components.join("/");
    if joined.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(joined)
}

/// Parent directory of a normalized path, or `None` for top-level entries.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Returns true when `path` equals `dir` or lives underneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}
