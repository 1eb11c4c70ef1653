//! Root-relative resource paths
//!
//! Lock scope is decided purely on normalized path strings: `/` is the root,
//! segments are separated by a single `/` and there is no trailing slash.

use crate::error::{Error, Result};

/// Normalize a root-relative path
///
/// Empty and `.` segments are dropped and `..` segments are rejected. Only
/// `/` separates segments; a backslash is an ordinary name character.
pub fn normalize(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("lock path must not be empty".to_string()));
    }

    let mut normalized = String::with_capacity(trimmed.len() + 1);
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidInput(format!(
                    "lock path '{}' must not contain '..'",
                    path
                )));
            }
            segment => {
                normalized.push('/');
                normalized.push_str(segment);
            }
        }
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Whether `ancestor` is a proper ancestor of `descendant`
///
/// Both paths must be normalized.
pub fn is_strict_ancestor(ancestor: &str, descendant: &str) -> bool {
    if ancestor == "/" {
        return descendant != "/";
    }
    descendant
        .strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Whether `path` equals `root` or lies below it
pub fn is_same_or_descendant(root: &str, path: &str) -> bool {
    root == path || is_strict_ancestor(root, path)
}
