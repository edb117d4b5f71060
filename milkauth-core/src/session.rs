//! Authentication lifecycle for the rest of the application.
//!
//! [`Authenticator`] ties the pieces together: it discovers an existing
//! credential at startup, falls back to the authorization handshake when none
//! validates, and keeps every configured store in step with the credential
//! installed on the shared client.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::authorization::{AuthorizationFlow, TicketGrant};
use crate::client::RtmClient;
use crate::config::AuthConfig;
use crate::discovery::{CredentialDiscovery, DiscoveryError, persist_credential};
use crate::error::MilkauthError;
use crate::model::{AuthStatus, AuthorizationTicket, CredentialSource, Permission};
use crate::store::{CredentialStore, persistence_backends, select_store};

pub struct Authenticator {
    config: AuthConfig,
    client: Arc<RtmClient>,
    backends: Vec<Arc<dyn CredentialStore>>,
    discovery: CredentialDiscovery,
    flow: AuthorizationFlow,
    status: RwLock<AuthStatus>,
    /// Ticket issued by the last unauthenticated `initialize`.
    startup_ticket: Mutex<Option<String>>,
}

impl Authenticator {
    /// Build the client and select the stores described by `config`.
    ///
    /// Fails only on configuration problems: missing application
    /// credentials, or a credential directory that cannot be created.
    pub async fn new(config: AuthConfig, cancel: &CancellationToken) -> Result<Self, MilkauthError> {
        if !config.has_application_credentials() {
            return Err(MilkauthError::Config {
                message: "api_key and shared_secret must both be set".to_string(),
            });
        }

        let client = RtmClient::new(&config)?.with_cancellation(cancel.child_token());
        let primary = select_store(&config.store, cancel).await?;
        let backends = persistence_backends(&config.store, primary)?;

        Ok(Self::with_backends(config, Arc::new(client), backends))
    }

    /// Assemble from parts.
    pub fn with_backends(
        config: AuthConfig,
        client: Arc<RtmClient>,
        backends: Vec<Arc<dyn CredentialStore>>,
    ) -> Self {
        let discovery = CredentialDiscovery::new(client.clone(), config.discovery.clone())
            .with_backends(backends.clone())
            .with_retry_policy(config.verify_retry_policy());
        let flow = AuthorizationFlow::new(client.clone(), backends.clone());

        Self {
            config,
            client,
            backends,
            discovery,
            flow,
            status: RwLock::new(AuthStatus::default()),
            startup_ticket: Mutex::new(None),
        }
    }

    /// Replace the environment lookup used by discovery.
    pub fn with_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.discovery = self.discovery.with_env(env);
        self
    }

    /// Find and install a credential.
    ///
    /// Finding nothing is not an error: the returned status is
    /// unauthenticated and carries a ticket and its authorization URL when one
    /// could be issued. Only the newest such ticket stays outstanding.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<AuthStatus, MilkauthError> {
        let status = match self.discovery.discover(cancel).await {
            Ok(found) => {
                let report = persist_credential(&found.credential, &self.backends).await;
                tracing::debug!(written = ?report.written, failed = report.failed.len(), "Discovered credential persisted");
                self.replace_startup_ticket(None);
                AuthStatus::authenticated(&found.credential, found.source)
            }
            Err(DiscoveryError::NotFound) => {
                match self.begin_authorization(self.config.permission, cancel).await {
                    Ok(grant) => {
                        self.replace_startup_ticket(Some(grant.ticket.clone()));
                        AuthStatus::awaiting_authorization(grant.ticket, grant.authorization_url)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not issue an authorization ticket");
                        AuthStatus::unauthenticated()
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        *self.status.write() = status.clone();
        Ok(status)
    }

    fn replace_startup_ticket(&self, ticket: Option<String>) {
        let previous = std::mem::replace(&mut *self.startup_ticket.lock(), ticket.clone());
        if let Some(previous) = previous.filter(|p| Some(p) != ticket.as_ref()) {
            self.flow.discard_ticket(&previous);
        }
    }

    /// Current authentication state.
    pub fn status(&self) -> AuthStatus {
        self.status.read().clone()
    }

    /// Start the handshake for `permission`.
    pub async fn begin_authorization(
        &self,
        permission: Permission,
        cancel: &CancellationToken,
    ) -> Result<TicketGrant, MilkauthError> {
        Ok(self.flow.request_ticket(permission, cancel).await?)
    }

    /// Finish the handshake for `ticket`.
    pub async fn complete_authorization(
        &self,
        ticket: &str,
        cancel: &CancellationToken,
    ) -> Result<AuthStatus, MilkauthError> {
        let completed = self.flow.complete_authorization(ticket, cancel).await?;
        {
            let mut startup = self.startup_ticket.lock();
            if startup.as_deref() == Some(ticket) {
                *startup = None;
            }
        }
        let status = AuthStatus::authenticated(&completed.credential, CredentialSource::Authorization);
        *self.status.write() = status.clone();
        Ok(status)
    }

    /// Forget the credential everywhere.
    ///
    /// Every store is attempted; the first failure is returned after all of
    /// them have been tried.
    pub async fn logout(&self) -> Result<(), MilkauthError> {
        self.client.clear_credential();
        *self.status.write() = AuthStatus::unauthenticated();

        let mut first_error = None;
        for backend in &self.backends {
            if let Err(e) = backend.delete().await {
                tracing::warn!(store = backend.name(), error = %e, "Failed to delete credential");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                tracing::info!("Logged out");
                Ok(())
            }
        }
    }

    /// The shared client, authorized once a credential is installed.
    pub fn client(&self) -> Arc<RtmClient> {
        self.client.clone()
    }

    pub fn backends(&self) -> &[Arc<dyn CredentialStore>] {
        &self.backends
    }

    pub fn pending_tickets(&self) -> Vec<AuthorizationTicket> {
        self.flow.pending_tickets()
    }
}
