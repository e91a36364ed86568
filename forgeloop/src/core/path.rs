//! Lexical resolution of generator-supplied paths against the workspace root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Reason a relative path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathRejected {
    #[error("path is empty or names the workspace root")]
    Empty,
    #[error("absolute path not allowed: {0}")]
    Absolute(String),
    #[error("path escapes the workspace root: {0}")]
    Escapes(String),
    #[error("path resolves through a link outside the workspace: {0}")]
    LinkEscape(String),
}

/// Join `relative` onto `root`, normalising `.` and `..` without touching the
/// filesystem. The result is always a strict descendant of `root`.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, PathRejected> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(PathRejected::Empty);
    }

    let mut resolved = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(PathRejected::Absolute(trimmed.to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(PathRejected::Escapes(trimmed.to_string()));
                }
            }
            Component::Normal(part) => resolved.push(part),
        }
    }

    if resolved.as_os_str().is_empty() {
        return Err(PathRejected::Empty);
    }
    Ok(root.join(resolved))
}

/// Render `path` relative to `root` with `/` separators.
pub fn display_relative(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
