use std::path::{Component, Path, PathBuf};

use crate::error::Error;

/// An agent's workspace — the directory jail all file tools operate in.
///
/// Every path an agent supplies is resolved against the workspace root and
/// must land back inside it. Symlinks are resolved *before* the containment
/// check so they cannot be used to break out.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (or create) a workspace at the given root directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| {
                Error::Config(format!(
                    "failed to create workspace at {}: {e}",
                    root.display()
                ))
            })?;
        }
        let root = root.canonicalize().map_err(|e| {
            Error::Config(format!(
                "failed to canonicalize workspace path {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    /// The absolute, canonical path to the workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path against the workspace root, rejecting escapes.
    ///
    /// The candidate is normalized lexically, then symlinks in its existing
    /// prefix are resolved, and the result must equal the root or start with
    /// `<root>/` — the trailing separator keeps `/ws-evil` from passing as
    /// being under `/ws`.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        let p = Path::new(path);

        // Joining an absolute path replaces the root, so the containment
        // check below rejects anything outside the workspace either way.
        let candidate = normalize_path(&self.root.join(p));
        let resolved = resolve_symlinked_prefix(&candidate)?;

        let root_str = self.root.to_string_lossy();
        let resolved_str = resolved.to_string_lossy();
        let contained = resolved == self.root
            || resolved_str.starts_with(&format!("{root_str}{}", std::path::MAIN_SEPARATOR));
        if !contained {
            return Err(Error::PathTraversal(path.to_string()));
        }
        Ok(resolved)
    }
}

/// Canonicalize the longest existing ancestor of `path` (resolving
/// symlinks), then re-append the non-existent tail. `canonicalize()` alone
/// fails on paths that don't exist yet, but create_file targets usually
/// don't.
fn resolve_symlinked_prefix(path: &Path) -> Result<PathBuf, Error> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| Error::Config(format!("failed to resolve {}: {e}", existing.display())))?;
    for component in tail.iter().rev() {
        resolved.push(component);
    }
    Ok(resolved)
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                _ => components.push(component),
            },
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    components.iter().collect()
}
