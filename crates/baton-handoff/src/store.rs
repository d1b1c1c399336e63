use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use baton_core::error::Result;
use baton_core::types::CompressionQuality;

/// A compressed context parked until its target claims it.
#[derive(Debug, Clone)]
pub struct StoredContext {
    pub payload: Vec<u8>,
    pub original_size: usize,
    pub quality: CompressionQuality,
    pub stored_at: DateTime<Utc>,
}

impl StoredContext {
    pub fn compressed_size(&self) -> usize {
        self.payload.len()
    }
}

/// Key-value storage for handoff payloads, addressed only by handoff id.
///
/// The in-memory store is the default; a database-backed implementation can
/// be swapped in without touching the manager.
pub trait ContextStore: Send + Sync + 'static {
    fn put<'a>(&'a self, key: &'a str, value: StoredContext) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredContext>>>;

    /// Remove a payload. Returns whether anything was removed.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;
}

#[derive(Default)]
pub struct MemoryContextStore {
    entries: RwLock<HashMap<String, StoredContext>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl ContextStore for MemoryContextStore {
    fn put<'a>(&'a self, key: &'a str, value: StoredContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.write().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredContext>>> {
        Box::pin(async move { Ok(self.entries.read().await.get(key).cloned()) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.entries.write().await.remove(key).is_some()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes: &[u8]) -> StoredContext {
        StoredContext {
            payload: bytes.to_vec(),
            original_size: bytes.len() * 2,
            quality: CompressionQuality::Balanced,
            stored_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryContextStore::new();
        store.put("h1", sample(b"abc")).await.unwrap();
        assert_eq!(store.len().await, 1);

        let got = store.get("h1").await.unwrap().unwrap();
        assert_eq!(got.compressed_size(), 3);
        assert_eq!(got.original_size, 6);

        assert!(store.delete("h1").await.unwrap());
        assert!(!store.delete("h1").await.unwrap());
        assert!(store.get("h1").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
