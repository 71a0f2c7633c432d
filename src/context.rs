//! Build context access
//!
//! The application source tree is read through [`BuildContext`] so the
//! pipeline never touches paths outside of it directly.

use crate::error::{KilnError, KilnResult};
use std::path::{Component, Path, PathBuf};

/// Directories never included in a build context listing
const IGNORED_DIRS: &[&str] = &[".git"];

/// Read-only view of the application source tree
pub trait BuildContext: Send + Sync {
    /// Whether a relative path exists in the context
    fn contains(&self, path: &str) -> bool;

    /// Every regular file as a relative path, sorted
    fn list_files(&self) -> KilnResult<Vec<String>>;

    /// File contents by relative path
    fn get_file(&self, path: &str) -> KilnResult<Vec<u8>>;

    /// Whether a file carries an executable bit
    fn is_executable(&self, _path: &str) -> bool {
        false
    }

    /// Directory on disk holding the context
    fn root(&self) -> &Path;
}

/// A build context backed by a local directory
#[derive(Debug, Clone)]
pub struct DirectoryContext {
    root: PathBuf,
}

impl DirectoryContext {
    pub fn open(root: impl Into<PathBuf>) -> KilnResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(KilnError::ContextMissing(root));
        }
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> KilnResult<PathBuf> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(KilnError::User(format!(
                "path '{}' escapes the build context",
                path
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl BuildContext for DirectoryContext {
    fn contains(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn list_files(&self) -> KilnResult<Vec<String>> {
        let mut files = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && IGNORED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                KilnError::Internal(format!("walking {}: {}", self.root.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| KilnError::Internal(e.to_string()))?;
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
        files.sort();
        Ok(files)
    }

    fn get_file(&self, path: &str) -> KilnResult<Vec<u8>> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|e| KilnError::io(format!("reading {}", full.display()), e))
    }

    fn is_executable(&self, path: &str) -> bool {
        use std::os::unix::fs::PermissionsExt;
        self.resolve(path)
            .and_then(|p| {
                std::fs::metadata(&p).map_err(|e| KilnError::io(format!("reading {}", p.display()), e))
            })
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}
