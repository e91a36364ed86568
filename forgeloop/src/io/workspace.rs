//! Sandboxed project directory that generator file actions are confined to.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::path::{PathRejected, display_relative, resolve_within};

/// Directory under the workspace root that holds loop artifacts. Hidden from
/// the file listing given to the generator.
pub const ARTIFACT_DIR: &str = ".forgeloop";

/// A path that passed the sandbox check. Only [`ProjectWorkspace::resolve`]
/// constructs these, so writes cannot target unchecked paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    absolute: PathBuf,
    relative: String,
}

impl ResolvedPath {
    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    /// Normalised `/`-separated path relative to the workspace root.
    pub fn relative(&self) -> &str {
        &self.relative
    }
}

/// What a delete actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Clone)]
pub struct ProjectWorkspace {
    root: PathBuf,
}

impl ProjectWorkspace {
    /// Create the root directory if needed and canonicalise it.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .with_context(|| format!("create workspace {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize workspace {}", root.display()))?;
        info!(root = %root.display(), "workspace ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a generator-supplied relative path. Rejects absolute paths,
    /// `..` escapes and paths whose existing ancestors link outside the root.
    pub fn resolve(&self, relative: &str) -> Result<ResolvedPath, PathRejected> {
        let absolute = resolve_within(&self.root, relative)?;
        self.check_links(&absolute, relative)?;
        Ok(ResolvedPath {
            relative: display_relative(&self.root, &absolute),
            absolute,
        })
    }

    /// The deepest existing ancestor (or the path itself) must canonicalise
    /// inside the root, otherwise a symlink would carry the write elsewhere.
    fn check_links(&self, absolute: &Path, relative: &str) -> Result<(), PathRejected> {
        let escape = || PathRejected::LinkEscape(relative.trim().to_string());
        let mut probe = Some(absolute);
        while let Some(candidate) = probe {
            if candidate.symlink_metadata().is_ok() {
                let real = candidate.canonicalize().map_err(|_| escape())?;
                return if real.starts_with(&self.root) {
                    Ok(())
                } else {
                    Err(escape())
                };
            }
            probe = candidate.parent();
        }
        Err(escape())
    }

    /// Write full content, creating parent directories and overwriting.
    pub fn write_file(&self, path: &ResolvedPath, content: &str) -> Result<()> {
        if let Some(parent) = path.absolute.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory for {}", path.relative))?;
        }
        fs::write(&path.absolute, content).with_context(|| format!("write {}", path.relative))?;
        debug!(path = %path.relative, bytes = content.len(), "wrote file");
        Ok(())
    }

    /// Delete a file or directory. An absent path is a logged no-op.
    pub fn delete(&self, path: &ResolvedPath) -> Result<DeleteOutcome> {
        let Ok(meta) = path.absolute.symlink_metadata() else {
            warn!(path = %path.relative, "delete of non-existent path");
            return Ok(DeleteOutcome::AlreadyAbsent);
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path.absolute)
                .with_context(|| format!("remove directory {}", path.relative))?;
        } else {
            fs::remove_file(&path.absolute)
                .with_context(|| format!("remove {}", path.relative))?;
        }
        debug!(path = %path.relative, "deleted");
        Ok(DeleteOutcome::Deleted)
    }

    pub fn read_file(&self, path: &ResolvedPath) -> Result<String> {
        fs::read_to_string(&path.absolute).with_context(|| format!("read {}", path.relative))
    }

    /// Sorted `/`-separated relative paths of every file, excluding the
    /// artifact directory. Unreadable entries are skipped with a warning.
    pub fn list_files(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != ARTIFACT_DIR)
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(err = %err, "skipping unreadable workspace entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| display_relative(&self.root, entry.path()))
            .collect();
        files.sort();
        files
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join(ARTIFACT_DIR)
    }
}

/// Directory-safe project name: lowercase, spaces to `_`, only alphanumerics,
/// `_` and `-`, at most 50 characters, `project` when nothing survives.
pub fn sanitize_project_name(name: &str) -> String {
    let safe: String = name
        .trim()
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .take(50)
        .collect();
    if safe.is_empty() {
        "project".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, ProjectWorkspace) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = ProjectWorkspace::create(temp.path().join("project")).expect("workspace");
        (temp, ws)
    }

    #[test]
    fn create_makes_missing_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = ProjectWorkspace::create(temp.path().join("a").join("b")).expect("workspace");
        assert!(ws.root().is_dir());
    }

    #[test]
    fn resolve_rejects_traversal() {
        let (_temp, ws) = workspace();
        assert!(matches!(
            ws.resolve("../../etc/passwd"),
            Err(PathRejected::Escapes(_))
        ));
        assert!(matches!(
            ws.resolve("/etc/passwd"),
            Err(PathRejected::Absolute(_))
        ));
    }

    #[test]
    fn resolve_normalises_relative_display() {
        let (_temp, ws) = workspace();
        let resolved = ws.resolve("./src/../app.py").expect("resolve");
        assert_eq!(resolved.relative(), "app.py");
        assert_eq!(resolved.absolute(), ws.root().join("app.py"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_leading_outside() {
        let (temp, ws) = workspace();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).expect("outside dir");
        std::os::unix::fs::symlink(&outside, ws.root().join("link")).expect("symlink");

        assert!(matches!(
            ws.resolve("link/secret.txt"),
            Err(PathRejected::LinkEscape(_))
        ));
    }

    #[test]
    fn write_creates_parents_and_overwrites() {
        let (_temp, ws) = workspace();
        let path = ws.resolve("pkg/mod/app.py").expect("resolve");

        ws.write_file(&path, "one").expect("write");
        ws.write_file(&path, "two").expect("overwrite");

        assert_eq!(ws.read_file(&path).expect("read"), "two");
    }

    #[test]
    fn delete_is_idempotent() {
        let (_temp, ws) = workspace();
        let path = ws.resolve("gone.txt").expect("resolve");
        ws.write_file(&path, "x").expect("write");

        assert_eq!(ws.delete(&path).expect("delete"), DeleteOutcome::Deleted);
        assert_eq!(
            ws.delete(&path).expect("delete again"),
            DeleteOutcome::AlreadyAbsent
        );
    }

    #[test]
    fn list_files_is_sorted_and_hides_artifacts() {
        let (_temp, ws) = workspace();
        for name in ["b.py", "a/z.txt", "a/c.txt"] {
            let path = ws.resolve(name).expect("resolve");
            ws.write_file(&path, "x").expect("write");
        }
        fs::create_dir_all(ws.artifact_dir().join("iterations")).expect("artifact dir");
        fs::write(ws.artifact_dir().join("iterations").join("meta.json"), "{}")
            .expect("artifact");

        assert_eq!(ws.list_files(), vec!["a/c.txt", "a/z.txt", "b.py"]);
    }

    #[test]
    fn sanitize_project_name_matches_directory_rules() {
        assert_eq!(sanitize_project_name("  My Cool App! "), "my_cool_app");
        assert_eq!(sanitize_project_name("!!!"), "project");
        assert_eq!(sanitize_project_name(&"x".repeat(80)).len(), 50);
        assert_eq!(sanitize_project_name("web-api_v2"), "web-api_v2");
    }
}
