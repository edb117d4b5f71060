//! Credential storage abstraction.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`CredentialStore`] - Trait for credential persistence backends
//! - [`KeyringStore`] - OS keyring implementation (with `keyring-store` feature)
//! - [`FileStore`] - JSON file fallback
//! - [`MemoryStore`] - In-memory implementation for tests and ephemeral sessions
//! - [`select_store`] - One-time startup selection of the backend
//!
//! Every backend holds exactly one [`Credential`] record.
//!
//! # Example
//!
//! ```rust,ignore
//! use milkauth_core::store::{select_store, StoreConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = select_store(&StoreConfig::default(), &CancellationToken::new()).await?;
//! store.save("token", "1234", "alice").await?;
//! assert_eq!(store.load().await?.unwrap().expose(), "token");
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use crate::config::StoreConfig;
use crate::model::Credential;

mod file;
mod memory;
#[cfg(feature = "keyring-store")]
mod keyring;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "keyring-store")]
pub use keyring::KeyringStore;

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value,
/// and the memory is wiped on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

/// Error type for credential store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing is stored at the given location.
    #[error("no credential stored in {location}")]
    NotFound { location: String },

    /// The stored record could not be parsed. The record has been purged.
    #[error("corrupted credential record in {location}: {message}")]
    Corrupted { location: String, message: String },

    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// The secret service cannot be used right now.
    #[error("secret store unavailable: {message}")]
    Unavailable { message: String },

    /// A single backend call exceeded its time bound.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Cancellation was requested while the operation was pending.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// A retried write kept failing.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    /// The credential is not fit to be persisted.
    #[error("invalid credential: {message}")]
    InvalidCredential { message: String },

    /// Storage could not be set up (e.g. directory creation failed).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// I/O error reading or writing a credential file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::BackendError { .. }
                | StoreError::Unavailable { .. }
                | StoreError::Timeout { .. }
                | StoreError::Io(_)
        )
    }
}

/// Outcome of one step of a store self-test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreProbeResult {
    pub operation: String,
    pub success: bool,
    pub error: Option<String>,
    pub value: Option<String>,
}

impl StoreProbeResult {
    pub fn ok(operation: impl Into<String>, value: Option<String>) -> Self {
        Self {
            operation: operation.into(),
            success: true,
            error: None,
            value,
        }
    }

    pub fn failed(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            success: false,
            error: Some(error.to_string()),
            value: None,
        }
    }
}

/// A persistence backend holding one credential record.
///
/// Implementations include:
/// - [`KeyringStore`] (with `keyring-store` feature) - OS keyring
/// - [`FileStore`] - owner-only JSON file
/// - [`MemoryStore`] - process memory
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Short backend name used in logs and reports.
    fn name(&self) -> &str;

    /// Non-destructive, time-bounded availability probe.
    async fn is_available(&self) -> bool;

    /// File backing this store, if it keeps its record in one.
    fn file_path(&self) -> Option<&Path> {
        None
    }

    /// Write a complete record, replacing whatever was stored.
    async fn store(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Read the full record.
    ///
    /// Returns `Ok(None)` when nothing is stored.
    async fn full_record(&self) -> Result<Option<Credential>, StoreError>;

    /// Remove the record.
    ///
    /// Returns `Ok(())` even if nothing was stored.
    async fn delete(&self) -> Result<(), StoreError>;

    /// Store a new record stamped with the current time.
    ///
    /// Overwrites any existing value; last write wins.
    async fn save(&self, token: &str, user_id: &str, username: &str) -> Result<(), StoreError> {
        self.store(&Credential::new(token, user_id, username)).await
    }

    /// Load the stored token.
    ///
    /// Returns `Ok(None)` when nothing is stored.
    async fn load(&self) -> Result<Option<Secret>, StoreError> {
        Ok(self.full_record().await?.map(|record| record.token.clone()))
    }

    /// Replace the stored credential, keeping the original creation time
    /// when a readable record exists.
    async fn update(&self, token: &str, user_id: &str, username: &str) -> Result<(), StoreError> {
        let fresh = Credential::new(token, user_id, username);
        let record = match self.full_record().await {
            Ok(Some(previous)) => {
                let mut merged = fresh.preserving_created_at(&previous);
                merged.permission = previous.permission;
                merged
            }
            Ok(None) => fresh,
            Err(e) => {
                tracing::warn!(store = self.name(), error = %e, "previous record unreadable, writing fresh record");
                fresh
            }
        };
        self.store(&record).await
    }
}

/// Reject records that must never reach a backend.
pub(crate) fn validate(credential: &Credential) -> Result<(), StoreError> {
    if !credential.has_token() {
        return Err(StoreError::InvalidCredential {
            message: "token is empty".to_string(),
        });
    }
    if credential.updated_at < credential.created_at {
        return Err(StoreError::InvalidCredential {
            message: "updatedAt precedes createdAt".to_string(),
        });
    }
    Ok(())
}

/// Choose the credential backend once at startup.
///
/// # Backend Selection Logic
///
/// - If `prefer_keyring` is set and the `keyring-store` feature is enabled,
///   the keyring is probed; when it answers, a [`KeyringStore`] is used.
/// - Otherwise a [`FileStore`] is created, including its directory. Failing to
///   create the directory is fatal and returned as [`StoreError::Config`].
///
/// The choice is never revisited; later backend failures surface as errors.
pub async fn select_store(
    config: &StoreConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn CredentialStore>, StoreError> {
    #[cfg(feature = "keyring-store")]
    if config.prefer_keyring {
        match KeyringStore::new(&config.keyring_service, &config.keyring_account) {
            Ok(store) => {
                let store = store
                    .with_timeout(config.operation_timeout())
                    .with_cancellation(cancel.child_token());
                if store.is_available().await {
                    tracing::info!(service = %config.keyring_service, "Using OS keyring for credential storage");
                    return Ok(Arc::new(store));
                }
                tracing::warn!("OS keyring not available, falling back to file storage");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Keyring unavailable, falling back to file storage");
            }
        }
    }

    #[cfg(not(feature = "keyring-store"))]
    if config.prefer_keyring {
        tracing::warn!(
            "Keyring storage requested but keyring-store feature not enabled. Using file storage."
        );
    }

    let _ = cancel;
    let path = config.resolved_file_path()?;
    let store = FileStore::create(path)?;
    tracing::info!(path = %store.path().display(), "Using file credential storage");
    Ok(Arc::new(store))
}

/// Every backend a fresh credential should be written to.
///
/// The primary store comes first; a file mirror is added when configured and
/// the primary is not already the file store.
pub fn persistence_backends(
    config: &StoreConfig,
    primary: Arc<dyn CredentialStore>,
) -> Result<Vec<Arc<dyn CredentialStore>>, StoreError> {
    let mut backends = vec![primary.clone()];

    if config.mirror_to_file && primary.name() != FileStore::NAME {
        let mirror = FileStore::create(config.resolved_file_path()?)?;
        backends.push(Arc::new(mirror));
    }

    Ok(backends)
}
