//! Trait definitions for the storage module.

use async_trait::async_trait;

use super::error::StorageError;

/// A blob store addressed by relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the name of this store implementation.
    fn name(&self) -> &str;

    /// Reads the full contents of the object at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes `data` to `path`, replacing any existing object.
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Removes the object at `path`.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Moves the object at `from` to `to`, replacing any object at `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Lists object paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
