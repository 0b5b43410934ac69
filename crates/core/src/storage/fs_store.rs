//! File system object store implementation.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::error::StorageError;
use super::traits::ObjectStore;

/// Object store backed by a directory tree.
///
/// Object paths map to files below `root`; intermediate directories are
/// created on write.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an object path to a file below the root, rejecting escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(StorageError::invalid_path(path, "empty path"));
        }

        let mut resolved = self.root.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(StorageError::invalid_path(
                        path,
                        "path must not leave the store root",
                    ))
                }
            }
        }
        Ok(resolved)
    }

    fn map_not_found(path: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound {
                path: path.to_string(),
            }
        } else {
            StorageError::Io(e)
        }
    }

    /// Converts a file below the root back to an object path.
    fn object_path(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let file = self.resolve(path)?;
        fs::read(&file)
            .await
            .map_err(|e| Self::map_not_found(path, e))
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&file, data).await?;
        debug!(path, "Stored object");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let file = self.resolve(path)?;
        fs::remove_file(&file)
            .await
            .map_err(|e| Self::map_not_found(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let destination = self.resolve(to)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &destination)
            .await
            .map_err(|e| Self::map_not_found(from, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_start_matches('/');

        // Start from the deepest directory the prefix names.
        let start = match prefix.rfind('/') {
            Some(idx) => self.resolve(&prefix[..idx])?,
            None => self.root.clone(),
        };

        let mut found = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    if let Some(object) = self.object_path(&entry.path()) {
                        if object.starts_with(prefix) {
                            found.push(object);
                        }
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let file = self.resolve(path)?;
        Ok(fs::try_exists(&file).await? && fs::metadata(&file).await?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn store() -> (FsObjectStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (FsObjectStore::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (store, _dir) = store();
        store
            .put("posts/2024/cover.jpg", b"jpeg bytes".to_vec())
            .await
            .unwrap();

        let data = store.get("posts/2024/cover.jpg").await.unwrap();
        assert_eq!(data, b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (store, _dir) = store();
        let err = store.get("missing.png").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = store();
        assert_ok!(store.put("a.png", vec![1, 2, 3]).await);
        assert_ok!(store.delete("a.png").await);

        assert!(!assert_ok!(store.exists("a.png").await));
        assert!(assert_err!(store.delete("a.png").await).is_not_found());
    }

    #[tokio::test]
    async fn test_rename_creates_parent() {
        let (store, _dir) = store();
        store.put("tmp/a.part", vec![9]).await.unwrap();
        store.rename("tmp/a.part", "final/a.webp").await.unwrap();

        assert!(!store.exists("tmp/a.part").await.unwrap());
        assert_eq!(store.get("final/a.webp").await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let (store, _dir) = store();
        for path in ["posts/a.jpg", "posts/b.png", "posts/old/c.jpg", "pages/d.jpg"] {
            store.put(path, vec![0]).await.unwrap();
        }

        let all_posts = store.list("posts/").await.unwrap();
        assert_eq!(all_posts, vec!["posts/a.jpg", "posts/b.png", "posts/old/c.jpg"]);

        let partial = store.list("posts/o").await.unwrap();
        assert_eq!(partial, vec!["posts/old/c.jpg"]);

        let everything = store.list("").await.unwrap();
        assert_eq!(everything.len(), 4);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let (store, _dir) = store();
        assert!(store.list("nothing/here/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_parent_escape() {
        let (store, _dir) = store();
        let err = store.get("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }
}
