//! File-backed credential storage.
//!
//! The record is a single JSON document. On unix the containing directory is
//! created `0700` and the file written `0600`. Every write goes to its own
//! sibling temp file that is renamed over the target, so readers see either
//! the old record or a complete new one, and the last rename wins.

use async_trait::async_trait;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{CredentialStore, StoreError, validate};
use crate::model::Credential;

/// Owner-only JSON file holding one credential.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub const NAME: &'static str = "file";

    /// Create a store for `path` without touching the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a store and make sure its directory exists.
    ///
    /// Failing to create the directory is a configuration error.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(path);
        store.ensure_dir()?;
        Ok(store)
    }

    /// Get the storage path for this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        if parent.is_dir() {
            return Ok(());
        }

        create_private_dir(parent).map_err(|e| StoreError::Config {
            message: format!("failed to create credential directory {}: {}", parent.display(), e),
        })
    }

    fn read_record(&self) -> Result<Option<Credential>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<Credential>(&contents) {
            Ok(record) if record.has_token() => Ok(Some(record)),
            Ok(_) => self.purge_corrupted("record has an empty token".to_string()),
            Err(e) => self.purge_corrupted(e.to_string()),
        }
    }

    fn purge_corrupted(&self, message: String) -> Result<Option<Credential>, StoreError> {
        tracing::warn!(
            path = %self.path.display(),
            error = %message,
            "Corrupted credential file, removing it",
        );
        if let Err(e) = remove_if_exists(&self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to remove corrupted credential file");
        }
        Err(StoreError::Corrupted {
            location: self.path.display().to_string(),
            message,
        })
    }

    fn write_record(&self, credential: &Credential) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let contents = serde_json::to_string_pretty(credential)?;

        // Each write gets its own temp file, so overlapping saves never share one.
        let mut tmp = self.temp_builder().tempfile_in(self.dir())?;
        tmp.as_file_mut().write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        Ok(())
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn temp_builder(&self) -> tempfile::Builder<'static, 'static> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".milkauth-").suffix(".tmp");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o600));
        }
        builder
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn file_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn is_available(&self) -> bool {
        !self.path.is_dir() && self.ensure_dir().is_ok()
    }

    async fn store(&self, credential: &Credential) -> Result<(), StoreError> {
        validate(credential)?;
        self.write_record(credential)?;
        tracing::debug!(path = %self.path.display(), "Stored credential file");
        Ok(())
    }

    async fn full_record(&self) -> Result<Option<Credential>, StoreError> {
        self.read_record()
    }

    async fn delete(&self) -> Result<(), StoreError> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("milkauth").join("token.json");
        let store = FileStore::create(path).unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_not_error() {
        let (store, _temp) = test_store();
        assert!(store.load().await.unwrap().is_none());
        assert!(store.full_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (store, _temp) = test_store();
        store.save("tok", "42", "alice").await.unwrap();

        let record = store.full_record().await.unwrap().unwrap();
        assert_eq!(record.token.expose(), "tok");
        assert_eq!(record.user_id, "42");
        assert_eq!(record.username, "alice");
    }

    #[tokio::test]
    async fn test_second_save_overwrites() {
        let (store, _temp) = test_store();
        store.save("first", "1", "alice").await.unwrap();
        store.save("second", "1", "alice").await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().expose(), "second");
    }

    #[tokio::test]
    async fn test_update_scenario() {
        let (store, _temp) = test_store();
        store.save("tok1", "u1", "alice").await.unwrap();
        let created = store.full_record().await.unwrap().unwrap().created_at;

        store.update("tok2", "u1", "alice").await.unwrap();

        assert_eq!(store.load().await.unwrap().unwrap().expose(), "tok2");
        let record = store.full_record().await.unwrap().unwrap();
        assert_eq!(record.created_at, created);
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, _temp) = test_store();
        store.delete().await.unwrap();

        store.save("tok", "1", "alice").await.unwrap();
        store.delete().await.unwrap();
        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_reported_then_purged() {
        let (store, _temp) = test_store();
        fs::write(store.path(), "{ not json").unwrap();

        let result = store.load().await;
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
        assert!(!store.path().exists());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_uses_expected_json_fields() {
        let (store, _temp) = test_store();
        store.save("tok", "42", "alice").await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        for field in ["token", "userID", "username", "createdAt", "updatedAt"] {
            assert!(raw.get(field).is_some(), "missing field {}", field);
        }
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let (store, temp) = test_store();
        store.save("tok", "1", "alice").await.unwrap();

        let entries: Vec<_> = fs::read_dir(temp.path().join("milkauth"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["token.json".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (store, temp) = test_store();
        store.save("tok", "1", "alice").await.unwrap();

        let file_mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        let dir_mode = fs::metadata(temp.path().join("milkauth"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;

        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_saves_last_write_wins() {
        let (store, temp) = test_store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.save(&format!("tok{}", i), "1", "alice").await })
            })
            .collect();

        let mut errors = Vec::new();
        for handle in handles {
            if let Err(e) = handle.await.unwrap() {
                errors.push(e.to_string());
            }
        }
        assert!(errors.is_empty(), "{:?}", errors);

        let record = store.full_record().await.unwrap().unwrap();
        assert!(record.token.expose().starts_with("tok"));

        let leftovers: Vec<_> = fs::read_dir(temp.path().join("milkauth"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "token.json")
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_is_available() {
        let (store, temp) = test_store();
        assert!(store.is_available().await);

        let dir_store = FileStore::new(temp.path());
        assert!(!dir_store.is_available().await);
    }
}
