//! Media-root path resolution.
//!
//! Clients address files by a path relative to the configured media folder.
//! Resolution canonicalizes and then proves containment, so symlink tricks
//! and `..` traversal both fall out as `None` rather than as escapes.

use std::path::{Component, Path, PathBuf};

/// Map a client-relative path to a validated absolute path under `root`.
///
/// Returns `None` for absolute inputs, traversal attempts, paths that resolve
/// outside the root, or files that don't exist.
pub fn resolve_media_path(root: &Path, client_path: &str) -> Option<PathBuf> {
    let relative = Path::new(client_path.trim_start_matches(['/', '\\']));
    if relative.as_os_str().is_empty() {
        return None;
    }
    // Reject anything but plain name components before touching the fs.
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }

    let root = root.canonicalize().ok()?;
    let candidate = root.join(relative).canonicalize().ok()?;
    (candidate.starts_with(&root) && candidate.is_file()).then_some(candidate)
}
