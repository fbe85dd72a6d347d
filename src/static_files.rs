//! Static assets served directly by the coordinator

use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Resolve `file` under `root`, refusing anything that would land outside it
///
/// Both the root and the candidate are canonicalized so symlinks pointing out
/// of the root are rejected as well as `..` segments.
pub async fn resolve(root: &Path, file: &str) -> Option<PathBuf> {
    let relative = Path::new(file);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        warn!(file, "Rejected static file path outside the static root");
        return None;
    }

    let root = tokio::fs::canonicalize(root).await.ok()?;
    let candidate = tokio::fs::canonicalize(root.join(relative)).await.ok()?;

    if !candidate.starts_with(&root) {
        warn!(file, resolved = %candidate.display(), "Static file resolves outside the static root");
        return None;
    }

    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    if !metadata.is_file() {
        debug!(file, "Static path is not a regular file");
        return None;
    }

    Some(candidate)
}

/// Read a static file, returning `None` when it is missing or not allowed
pub async fn load(root: &Path, file: &str) -> Option<Vec<u8>> {
    let path = resolve(root, file).await?;
    match tokio::fs::read(&path).await {
        Ok(contents) => Some(contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read static file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("public");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(root.join("docs/guide.html"), "guide").unwrap();
        std::fs::write(dir.path().join("secret"), "top secret").unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn test_load_existing_file() {
        let (_dir, root) = fixture();
        assert_eq!(load(&root, "index.html").await.unwrap(), b"<h1>hi</h1>");
        assert_eq!(load(&root, "./docs/guide.html").await.unwrap(), b"guide");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let (_dir, root) = fixture();
        assert!(load(&root, "nope.html").await.is_none());
    }

    #[tokio::test]
    async fn test_parent_segments_rejected() {
        let (_dir, root) = fixture();
        assert!(load(&root, "../secret").await.is_none());
        assert!(load(&root, "docs/../../secret").await.is_none());
    }

    #[tokio::test]
    async fn test_absolute_path_rejected() {
        let (dir, root) = fixture();
        let absolute = dir.path().join("secret");
        assert!(load(&root, absolute.to_str().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_directory_is_not_served() {
        let (_dir, root) = fixture();
        assert!(load(&root, "docs").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (dir, root) = fixture();
        std::os::unix::fs::symlink(dir.path().join("secret"), root.join("link.html")).unwrap();
        assert!(load(&root, "link.html").await.is_none());
    }
}
