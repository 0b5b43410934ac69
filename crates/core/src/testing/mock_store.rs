//! Mock object store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::storage::{ObjectStore, StorageError};

/// A recorded storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Get(String),
    Put(String),
    Delete(String),
    Rename { from: String, to: String },
    List(String),
}

/// In-memory implementation of [`ObjectStore`].
///
/// Clones share the same objects, so a test can keep one handle while the
/// converter owns another.
#[derive(Debug, Clone, Default)]
pub struct MockObjectStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    fail_get: Arc<RwLock<HashSet<String>>>,
    fail_put: Arc<RwLock<HashSet<String>>>,
    fail_delete: Arc<RwLock<HashSet<String>>>,
    latency: Arc<RwLock<Duration>>,
    operations: Arc<RwLock<Vec<StorageOp>>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing failure injection.
    pub async fn insert(&self, path: &str, data: Vec<u8>) {
        self.objects.write().await.insert(path.to_string(), data);
    }

    pub async fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(path).cloned()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.objects.read().await.contains_key(path)
    }

    /// All stored paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Make reads of `path` fail with a backend error.
    pub async fn fail_get(&self, path: &str) {
        self.fail_get.write().await.insert(path.to_string());
    }

    /// Make writes to `path` fail with a backend error.
    pub async fn fail_put(&self, path: &str) {
        self.fail_put.write().await.insert(path.to_string());
    }

    /// Make deletes of `path` fail with a backend error.
    pub async fn fail_delete(&self, path: &str) {
        self.fail_delete.write().await.insert(path.to_string());
    }

    /// Delay applied to every operation.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    pub async fn operations(&self) -> Vec<StorageOp> {
        self.operations.read().await.clone()
    }

    /// Number of put calls, including failed ones.
    pub async fn writes(&self) -> usize {
        self.operations
            .read()
            .await
            .iter()
            .filter(|op| matches!(op, StorageOp::Put(_)))
            .count()
    }

    /// Number of delete calls, including failed ones.
    pub async fn deletes(&self) -> usize {
        self.operations
            .read()
            .await
            .iter()
            .filter(|op| matches!(op, StorageOp::Delete(_)))
            .count()
    }

    async fn begin(&self, op: StorageOp) {
        self.operations.write().await.push(op);
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.begin(StorageOp::Get(path.to_string())).await;
        if self.fail_get.read().await.contains(path) {
            return Err(StorageError::backend(format!("injected read failure for {path}")));
        }
        self.object(path).await.ok_or_else(|| StorageError::NotFound {
            path: path.to_string(),
        })
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.begin(StorageOp::Put(path.to_string())).await;
        if self.fail_put.read().await.contains(path) {
            return Err(StorageError::backend(format!("injected write failure for {path}")));
        }
        self.insert(path, data).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.begin(StorageOp::Delete(path.to_string())).await;
        if self.fail_delete.read().await.contains(path) {
            return Err(StorageError::backend(format!("injected delete failure for {path}")));
        }
        match self.objects.write().await.remove(path) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.begin(StorageOp::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await;
        let mut objects = self.objects.write().await;
        let data = objects.remove(from).ok_or_else(|| StorageError::NotFound {
            path: from.to_string(),
        })?;
        objects.insert(to.to_string(), data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.begin(StorageOp::List(prefix.to_string())).await;
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }
}
