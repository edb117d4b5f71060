//! In-memory credential storage implementation.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CredentialStore, StoreError, validate};
use crate::model::Credential;

/// In-memory credential store for testing and single-session use.
///
/// This store is not persistent; data is lost when the process exits.
///
/// # Thread Safety
///
/// This implementation uses interior mutability via `RwLock` and is
/// safe to share across threads.
pub struct MemoryStore {
    record: RwLock<Option<Credential>>,
}

impl MemoryStore {
    pub const NAME: &'static str = "memory";

    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            record: RwLock::new(None),
        }
    }

    /// Create a memory store holding a credential.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            record: RwLock::new(Some(credential)),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("has_record", &self.record.read().is_some())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn store(&self, credential: &Credential) -> Result<(), StoreError> {
        validate(credential)?;
        *self.record.write() = Some(credential.clone());
        Ok(())
    }

    async fn full_record(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.record.read().clone())
    }

    async fn delete(&self) -> Result<(), StoreError> {
        self.record.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_save_load() {
        let store = MemoryStore::new();

        store.save("test-value", "1", "alice").await.unwrap();
        let retrieved = store.load().await.unwrap();

        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().expose(), "test-value");
    }

    #[tokio::test]
    async fn test_memory_store_load_empty() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());
        assert!(store.full_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_second_save_overwrites() {
        let store = MemoryStore::new();
        store.save("first", "1", "alice").await.unwrap();
        store.save("second", "2", "bob").await.unwrap();

        let record = store.full_record().await.unwrap().unwrap();
        assert_eq!(record.token.expose(), "second");
        assert_eq!(record.username, "bob");
    }

    #[tokio::test]
    async fn test_memory_store_delete_idempotent() {
        let store = MemoryStore::new();
        store.delete().await.unwrap();

        store.save("test-value", "1", "alice").await.unwrap();
        store.delete().await.unwrap();
        store.delete().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_update_preserves_created_at() {
        let store = MemoryStore::new();
        store.save("tok1", "u1", "alice").await.unwrap();
        let first = store.full_record().await.unwrap().unwrap();

        store.update("tok2", "u1", "alice").await.unwrap();
        let second = store.full_record().await.unwrap().unwrap();

        assert_eq!(store.load().await.unwrap().unwrap().expose(), "tok2");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_empty_token() {
        let store = MemoryStore::new();
        let result = store.save("", "1", "alice").await;
        assert!(matches!(result, Err(StoreError::InvalidCredential { .. })));
    }
}
