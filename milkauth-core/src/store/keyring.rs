//! OS keyring-backed credential storage implementation.

use async_trait::async_trait;
use keyring::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{CredentialStore, StoreError, StoreProbeResult, validate};
use crate::model::Credential;
use crate::retry::{RetryError, RetryExecutor, RetryPolicy};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_SUFFIX: &str = "__probe__";

/// OS keyring-backed credential store.
///
/// This store uses the platform's native keyring service:
/// - macOS: Keychain
/// - Linux: kernel keyutils or Secret Service, depending on build features
/// - Windows: Credential Manager
///
/// The credential record is stored as one JSON document in a single entry.
/// Every OS call runs on the blocking pool, bounded by a timeout and aborted
/// when the store's cancellation token fires, because some platforms block on
/// an unlock prompt.
///
/// # Example
///
/// ```rust,ignore
/// use milkauth_core::store::{CredentialStore, KeyringStore};
///
/// let store = KeyringStore::new("milkauth", "default")?;
/// store.save("my-token", "1234", "alice").await?;
/// ```
pub struct KeyringStore {
    service_name: String,
    account: String,
    entry: Arc<Entry>,
    probe_entry: Arc<Entry>,
    timeout: Duration,
    cancel: CancellationToken,
    retry: RetryExecutor,
}

impl KeyringStore {
    pub const NAME: &'static str = "keyring";

    /// Create a keyring store for the given service and account names.
    ///
    /// Returns an error if the keyring backend rejects the entry names.
    pub fn new(service_name: &str, account: &str) -> Result<Self, StoreError> {
        let entry = Entry::new(service_name, account).map_err(|e| StoreError::Unavailable {
            message: format!("failed to create keyring entry: {}", e),
        })?;
        let probe_entry = Entry::new(service_name, &format!("{}.{}", account, PROBE_SUFFIX))
            .map_err(|e| StoreError::Unavailable {
                message: format!("failed to create keyring probe entry: {}", e),
            })?;

        Ok(Self {
            service_name: service_name.to_string(),
            account: account.to_string(),
            entry: Arc::new(entry),
            probe_entry: Arc::new(probe_entry),
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
            retry: RetryExecutor::new(RetryPolicy::linear(3, Duration::from_millis(200))),
        })
    }

    /// Bound every keyring call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort pending keyring calls and retry waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the retry policy applied to writes.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    /// Run a disposable set, get and delete cycle on a separate probe entry.
    ///
    /// Intended for troubleshooting; the real credential is never touched.
    pub async fn self_test(&self) -> Vec<StoreProbeResult> {
        let mut results = Vec::new();
        let value = format!("milkauth-probe-{}", chrono::Utc::now().timestamp_millis());

        let entry = self.probe_entry.clone();
        let written = value.clone();
        let set = self
            .blocking("keyring probe set", move || {
                entry.set_password(&written).map_err(|e| map_keyring_error("set", e))
            })
            .await;

        match set {
            Ok(()) => {
                results.push(StoreProbeResult::ok("set", None));

                let entry = self.probe_entry.clone();
                let get = self
                    .blocking("keyring probe get", move || {
                        entry.get_password().map_err(|e| map_keyring_error("get", e))
                    })
                    .await;

                match get {
                    Ok(read) if read == value => {
                        results.push(StoreProbeResult::ok("get", Some(read)));
                    }
                    Ok(read) => {
                        results.push(StoreProbeResult {
                            operation: "get".to_string(),
                            success: false,
                            error: Some("read value differs from written value".to_string()),
                            value: Some(read),
                        });
                    }
                    Err(e) => results.push(StoreProbeResult::failed("get", e)),
                }
            }
            Err(e) => results.push(StoreProbeResult::failed("set", e)),
        }

        let entry = self.probe_entry.clone();
        let delete = self
            .blocking("keyring probe delete", move || delete_entry(&entry))
            .await;
        match delete {
            Ok(()) => results.push(StoreProbeResult::ok("delete", None)),
            Err(e) => results.push(StoreProbeResult::failed("delete", e)),
        }

        for result in &results {
            tracing::debug!(
                operation = %result.operation,
                success = result.success,
                error = result.error.as_deref().unwrap_or(""),
                "keyring self-test step",
            );
        }

        results
    }

    async fn blocking<T, F>(&self, operation: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(f);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled {
                operation: operation.to_string(),
            }),
            result = tokio::time::timeout(self.timeout, handle) => match result {
                Err(_) => Err(StoreError::Timeout {
                    operation: operation.to_string(),
                    timeout: self.timeout,
                }),
                Ok(Err(join)) => Err(StoreError::BackendError {
                    message: format!("{} task failed: {}", operation, join),
                }),
                Ok(Ok(inner)) => inner,
            },
        }
    }

    async fn purge(&self) {
        let entry = self.entry.clone();
        if let Err(e) = self.blocking("keyring purge", move || delete_entry(&entry)).await {
            tracing::error!(error = %e, "Failed to purge corrupted keyring entry");
        }
    }

    fn location(&self) -> String {
        format!("keyring {}/{}", self.service_name, self.account)
    }
}

impl std::fmt::Debug for KeyringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringStore")
            .field("service_name", &self.service_name)
            .field("account", &self.account)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn is_available(&self) -> bool {
        let entry = self.entry.clone();
        let probe = self
            .blocking("keyring availability probe", move || match entry.get_password() {
                Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(map_keyring_error("probe", e)),
            })
            .await;

        match probe {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Keyring probe failed, treating keyring as unavailable");
                false
            }
        }
    }

    async fn store(&self, credential: &Credential) -> Result<(), StoreError> {
        validate(credential)?;
        let payload = Zeroizing::new(serde_json::to_string(credential)?);

        self.retry
            .run_if("keyring save", &self.cancel, StoreError::is_transient, || {
                let entry = self.entry.clone();
                let payload = payload.clone();
                self.blocking("keyring save", move || {
                    entry
                        .set_password(&payload)
                        .map_err(|e| map_keyring_error("set", e))
                })
            })
            .await
            .map_err(|e| match e {
                RetryError::Exhausted {
                    operation,
                    attempts,
                    source,
                } => StoreError::RetriesExhausted {
                    operation,
                    attempts,
                    source: Box::new(source),
                },
                RetryError::Aborted { source, .. } => source,
                RetryError::Cancelled { operation, .. } => StoreError::Cancelled { operation },
            })?;

        tracing::debug!(service = %self.service_name, "Stored credential in keyring");
        Ok(())
    }

    async fn full_record(&self) -> Result<Option<Credential>, StoreError> {
        let entry = self.entry.clone();
        let raw = self
            .blocking("keyring load", move || match entry.get_password() {
                Ok(raw) => Ok(Some(Zeroizing::new(raw))),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(map_keyring_error("get", e)),
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let parsed = serde_json::from_str::<Credential>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|record| {
                if record.has_token() {
                    Ok(record)
                } else {
                    Err("record has an empty token".to_string())
                }
            });

        match parsed {
            Ok(record) => Ok(Some(record)),
            Err(message) => {
                tracing::warn!(location = %self.location(), error = %message, "Corrupted keyring record, purging");
                self.purge().await;
                Err(StoreError::Corrupted {
                    location: self.location(),
                    message,
                })
            }
        }
    }

    async fn delete(&self) -> Result<(), StoreError> {
        let entry = self.entry.clone();
        self.blocking("keyring delete", move || delete_entry(&entry))
            .await
    }
}

fn delete_entry(entry: &Entry) -> Result<(), StoreError> {
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(map_keyring_error("delete", e)),
    }
}

/// Access problems (locked keychain, pending unlock prompt) are reported as
/// `Unavailable`; everything else as a backend error.
fn map_keyring_error(operation: &str, error: keyring::Error) -> StoreError {
    match error {
        keyring::Error::NoStorageAccess(e) => StoreError::Unavailable {
            message: format!("keyring {}: no storage access: {}", operation, e),
        },
        keyring::Error::Ambiguous(entries) => StoreError::Unavailable {
            message: format!("keyring {}: {} ambiguous entries", operation, entries.len()),
        },
        keyring::Error::PlatformFailure(e) => StoreError::BackendError {
            message: format!("keyring {}: platform failure: {}", operation, e),
        },
        other => StoreError::BackendError {
            message: format!("keyring {}: {}", operation, other),
        },
    }
}
