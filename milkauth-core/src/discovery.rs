//! Locating an existing credential and persisting verified ones.
//!
//! Candidates are tried in a fixed order: environment variables, the records
//! held by the configured stores, then credential files on disk. Every
//! candidate is verified remotely before it is accepted. A rejected candidate
//! is only uninstalled from the client; nothing on disk or in the keyring is
//! touched by a failed check.

use futures::future::join_all;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, AuthInfo, RtmClient};
use crate::config::DiscoveryConfig;
use crate::model::{Credential, CredentialSource};
use crate::retry::{RetryError, RetryExecutor, RetryPolicy};
use crate::store::{CredentialStore, Secret, StoreError};

/// Environment lookup, injectable so tests never touch process state.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

const VERIFY_OPERATION: &str = "verify credential";

/// Error type for credential discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No candidate passed remote verification.
    #[error("no valid credential found")]
    NotFound,

    #[error("credential discovery cancelled")]
    Cancelled,
}

/// A credential that passed remote verification.
#[derive(Debug, Clone)]
pub struct DiscoveredCredential {
    pub credential: Credential,
    pub source: CredentialSource,
}

/// Outcome of writing a credential to several backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Backends that accepted the record.
    pub written: Vec<String>,
    /// Backends that failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl PersistReport {
    /// At least one backend holds the credential.
    pub fn is_persisted(&self) -> bool {
        !self.written.is_empty()
    }
}

/// Credential file contents. Only `token` is required; older files may
/// lack the owner and timestamps.
#[derive(Deserialize)]
struct CredentialFile {
    token: String,
    #[serde(default, rename = "userID")]
    user_id: String,
    #[serde(default)]
    username: String,
    #[serde(default, rename = "createdAt")]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct Candidate {
    token: Secret,
    previous: Option<Credential>,
    source: CredentialSource,
}

/// Finds the first credential the remote service accepts.
pub struct CredentialDiscovery {
    client: Arc<RtmClient>,
    config: DiscoveryConfig,
    backends: Vec<Arc<dyn CredentialStore>>,
    env: EnvLookup,
    retry: RetryExecutor,
}

impl CredentialDiscovery {
    pub fn new(client: Arc<RtmClient>, config: DiscoveryConfig) -> Self {
        Self {
            client,
            config,
            backends: Vec::new(),
            env: Arc::new(|name| std::env::var(name).ok()),
            retry: RetryExecutor::default(),
        }
    }

    /// Consult these stores after the environment and before files.
    pub fn with_backends(mut self, backends: Vec<Arc<dyn CredentialStore>>) -> Self {
        self.backends = backends;
        self
    }

    /// Replace the process environment lookup.
    pub fn with_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(env);
        self
    }

    /// Retry policy for transient verification failures.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    /// Try every candidate in order and return the first that verifies.
    ///
    /// On success the credential stays installed on the client.
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredCredential, DiscoveryError> {
        for candidate in self.env_candidates() {
            if let Some(found) = self.try_candidate(candidate, cancel).await? {
                return Ok(found);
            }
        }

        for backend in &self.backends {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            let Some(candidate) = self.store_candidate(backend.as_ref()).await else {
                continue;
            };
            if let Some(found) = self.try_candidate(candidate, cancel).await? {
                return Ok(found);
            }
        }

        for path in self.config.candidate_paths() {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            if self.is_backend_file(&path) {
                tracing::debug!(path = %path.display(), "Skipping search file already read as a store");
                continue;
            }
            let Some(candidate) = read_candidate_file(&path).await else {
                continue;
            };
            if let Some(found) = self.try_candidate(candidate, cancel).await? {
                return Ok(found);
            }
        }

        tracing::info!("No valid credential found");
        Err(DiscoveryError::NotFound)
    }

    fn is_backend_file(&self, path: &Path) -> bool {
        self.backends
            .iter()
            .filter_map(|backend| backend.file_path())
            .any(|backend_path| backend_path == path)
    }

    fn env_candidates(&self) -> Vec<Candidate> {
        self.config
            .env_vars
            .iter()
            .filter_map(|name| {
                let value = (self.env)(name)?;
                let value = value.trim();
                if value.is_empty() {
                    return None;
                }
                Some(Candidate {
                    token: Secret::new(value),
                    previous: None,
                    source: CredentialSource::Environment(name.clone()),
                })
            })
            .collect()
    }

    async fn store_candidate(&self, store: &dyn CredentialStore) -> Option<Candidate> {
        match store.full_record().await {
            Ok(Some(record)) => Some(Candidate {
                token: record.token.clone(),
                source: CredentialSource::Store(store.name().to_string()),
                previous: Some(record),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(store = store.name(), error = %e, "Skipping unreadable credential store");
                None
            }
        }
    }

    /// Verify one candidate. `Ok(None)` means rejected; move on.
    async fn try_candidate(
        &self,
        candidate: Candidate,
        cancel: &CancellationToken,
    ) -> Result<Option<DiscoveredCredential>, DiscoveryError> {
        let source = candidate.source;
        tracing::debug!(%source, "Verifying credential candidate");

        let client = self.client.as_ref();
        client.install_credential(candidate.token.clone());

        let result = self
            .retry
            .run_if(VERIFY_OPERATION, cancel, ApiError::is_transient, move || {
                client.check_credential()
            })
            .await;

        match result {
            Ok(info) => {
                let credential = verified_credential(info, candidate.token, candidate.previous.as_ref());
                tracing::info!(%source, username = %credential.username, "Credential verified");
                Ok(Some(DiscoveredCredential { credential, source }))
            }
            Err(e) => {
                client.clear_credential();
                if is_cancelled(&e) {
                    return Err(DiscoveryError::Cancelled);
                }
                tracing::warn!(%source, attempts = e.attempts(), error = %e, "Credential rejected");
                Ok(None)
            }
        }
    }
}

fn is_cancelled(e: &RetryError<ApiError>) -> bool {
    match e {
        RetryError::Cancelled { .. } => true,
        RetryError::Aborted { source, .. } | RetryError::Exhausted { source, .. } => {
            matches!(source, ApiError::Cancelled)
        }
    }
}

fn verified_credential(info: AuthInfo, token: Secret, previous: Option<&Credential>) -> Credential {
    let mut credential = Credential::new(token.into_inner(), info.user.id, info.user.username);
    credential.permission = info.permission.or(previous.and_then(|p| p.permission));
    match previous {
        Some(previous) => credential.preserving_created_at(previous),
        None => credential,
    }
}

async fn read_candidate_file(path: &Path) -> Option<Candidate> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable credential file");
            return None;
        }
    };

    let file: CredentialFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unparseable credential file");
            return None;
        }
    };

    let token = file.token.trim();
    if token.is_empty() {
        tracing::warn!(path = %path.display(), "Skipping credential file with empty token");
        return None;
    }

    let previous = file.created_at.map(|created_at| {
        let mut record = Credential::new(token, file.user_id.clone(), file.username.clone());
        record.created_at = created_at;
        record
    });

    Some(Candidate {
        token: Secret::new(token),
        previous,
        source: CredentialSource::File(path.to_path_buf()),
    })
}

/// Write `credential` to every backend independently.
///
/// A failing backend never prevents the others from being written. A backend
/// already holding a record for the same user keeps that record's `createdAt`.
pub async fn persist_credential(
    credential: &Credential,
    backends: &[Arc<dyn CredentialStore>],
) -> PersistReport {
    let results = join_all(backends.iter().map(|backend| async move {
        (
            backend.name().to_string(),
            persist_one(backend.as_ref(), credential).await,
        )
    }))
    .await;

    let mut report = PersistReport::default();
    for (name, result) in results {
        match result {
            Ok(()) => {
                tracing::debug!(store = %name, "Credential persisted");
                report.written.push(name);
            }
            Err(e) => {
                tracing::warn!(store = %name, error = %e, "Failed to persist credential");
                report.failed.push((name, e.to_string()));
            }
        }
    }

    if !report.is_persisted() {
        tracing::warn!("Credential could not be persisted anywhere; keeping it in memory only");
    }

    report
}

async fn persist_one(store: &dyn CredentialStore, credential: &Credential) -> Result<(), StoreError> {
    let record = match store.full_record().await {
        Ok(Some(previous)) if previous.user_id == credential.user_id => {
            credential.clone().preserving_created_at(&previous)
        }
        Ok(_) => credential.clone(),
        Err(e) => {
            tracing::debug!(store = store.name(), error = %e, "Previous record unreadable, writing fresh record");
            credential.clone()
        }
    };
    store.store(&record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl CredentialStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }

        async fn is_available(&self) -> bool {
            false
        }

        async fn store(&self, _credential: &Credential) -> Result<(), StoreError> {
            Err(StoreError::BackendError {
                message: "disk on fire".to_string(),
            })
        }

        async fn full_record(&self) -> Result<Option<Credential>, StoreError> {
            Err(StoreError::BackendError {
                message: "disk on fire".to_string(),
            })
        }

        async fn delete(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persist_to_every_backend() {
        let a = Arc::new(MemoryStore::new());
        let b = Arc::new(MemoryStore::new());
        let backends: Vec<Arc<dyn CredentialStore>> = vec![a.clone(), b.clone()];

        let report = persist_credential(&Credential::new("tok", "1", "alice"), &backends).await;

        assert_eq!(report.written.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(a.load().await.unwrap().unwrap().expose(), "tok");
        assert_eq!(b.load().await.unwrap().unwrap().expose(), "tok");
    }

    #[tokio::test]
    async fn test_persist_partial_failure() {
        let good = Arc::new(MemoryStore::new());
        let backends: Vec<Arc<dyn CredentialStore>> = vec![Arc::new(BrokenStore), good.clone()];

        let report = persist_credential(&Credential::new("tok", "1", "alice"), &backends).await;

        assert_eq!(report.written, vec![MemoryStore::NAME.to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(report.is_persisted());
        assert!(good.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persist_total_failure_reports_nothing_written() {
        let backends: Vec<Arc<dyn CredentialStore>> = vec![Arc::new(BrokenStore)];
        let report = persist_credential(&Credential::new("tok", "1", "alice"), &backends).await;
        assert!(!report.is_persisted());
    }

    fn aged_record(token: &str, user_id: &str, days: i64) -> Credential {
        let mut record = Credential::new(token, user_id, "alice");
        record.created_at -= chrono::Duration::days(days);
        record.updated_at = record.created_at;
        record
    }

    #[tokio::test]
    async fn test_persist_keeps_created_at_for_same_user() {
        let old = aged_record("same", "1", 30);
        let store = Arc::new(MemoryStore::with_credential(old.clone()));
        let backends: Vec<Arc<dyn CredentialStore>> = vec![store.clone()];

        let report = persist_credential(&Credential::new("same", "1", "alice"), &backends).await;
        assert!(report.failed.is_empty());

        let record = store.full_record().await.unwrap().unwrap();
        assert_eq!(record.created_at, old.created_at);
        assert!(record.updated_at > old.updated_at);
    }

    #[tokio::test]
    async fn test_persist_resets_created_at_for_other_user() {
        let old = aged_record("theirs", "2", 30);
        let store = Arc::new(MemoryStore::with_credential(old.clone()));
        let backends: Vec<Arc<dyn CredentialStore>> = vec![store.clone()];

        let fresh = Credential::new("mine", "1", "alice");
        persist_credential(&fresh, &backends).await;

        let record = store.full_record().await.unwrap().unwrap();
        assert_eq!(record.token.expose(), "mine");
        assert_eq!(record.created_at, fresh.created_at);
    }

    #[tokio::test]
    async fn test_read_candidate_file_variants() {
        let temp = tempfile::TempDir::new().unwrap();

        let minimal = temp.path().join("minimal.json");
        std::fs::write(&minimal, r#"{"token": "abc"}"#).unwrap();
        let candidate = read_candidate_file(&minimal).await.unwrap();
        assert_eq!(candidate.token.expose(), "abc");
        assert!(candidate.previous.is_none());

        let full = temp.path().join("full.json");
        std::fs::write(
            &full,
            r#"{"token":"def","userID":"1","username":"alice","createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-02T00:00:00Z"}"#,
        )
        .unwrap();
        let candidate = read_candidate_file(&full).await.unwrap();
        assert_eq!(
            candidate.previous.unwrap().created_at.to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );

        let garbage = temp.path().join("garbage.json");
        std::fs::write(&garbage, "not json").unwrap();
        assert!(read_candidate_file(&garbage).await.is_none());

        let empty = temp.path().join("empty.json");
        std::fs::write(&empty, r#"{"token": "  "}"#).unwrap();
        assert!(read_candidate_file(&empty).await.is_none());

        assert!(read_candidate_file(&temp.path().join("missing.json")).await.is_none());
    }
}
