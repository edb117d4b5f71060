//! Interactive authorization handshake.
//!
//! 1. [`AuthorizationFlow::request_ticket`] asks the service for a ticket
//!    (`rtm.auth.getFrob`) and returns the URL the user must open.
//! 2. The user grants access in a browser.
//! 3. [`AuthorizationFlow::complete_authorization`] exchanges the ticket for a
//!    credential (`rtm.auth.getToken`), persists it and installs it.
//!
//! Outstanding tickets live in memory only. A ticket stays outstanding until it
//! is redeemed, so a failed or premature completion can be retried.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{ApiError, RtmClient};
use crate::discovery::{PersistReport, persist_credential};
use crate::model::{AuthorizationTicket, Credential, Permission};
use crate::store::CredentialStore;

/// Error type for the authorization handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The service does not recognise the ticket: access was never granted,
    /// or the ticket expired.
    #[error("authorization for ticket {ticket} was not granted or has expired")]
    Abandoned { ticket: String },

    #[error("authorization cancelled")]
    Cancelled,

    #[error("invalid authorization endpoint: {message}")]
    InvalidEndpoint { message: String },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A freshly issued ticket and where the user should grant it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketGrant {
    pub ticket: String,
    pub permission: Permission,
    pub authorization_url: String,
}

/// A redeemed ticket.
#[derive(Debug, Clone)]
pub struct CompletedAuthorization {
    pub credential: Credential,
    pub report: PersistReport,
}

/// Drives ticket issue and redemption against the shared client.
pub struct AuthorizationFlow {
    client: Arc<RtmClient>,
    backends: Vec<Arc<dyn CredentialStore>>,
    tickets: Mutex<HashMap<String, Permission>>,
}

impl AuthorizationFlow {
    pub fn new(client: Arc<RtmClient>, backends: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self {
            client,
            backends,
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a ticket for `permission`.
    ///
    /// Nothing is recorded when the service refuses.
    pub async fn request_ticket(
        &self,
        permission: Permission,
        cancel: &CancellationToken,
    ) -> Result<TicketGrant, AuthError> {
        let ticket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            ticket = self.client.issue_ticket() => ticket.map_err(map_api_error)?,
        };

        let authorization_url = self.build_authorization_url(&ticket, permission)?;
        self.tickets.lock().insert(ticket.clone(), permission);
        tracing::info!(%permission, "Authorization ticket issued");

        Ok(TicketGrant {
            ticket,
            permission,
            authorization_url,
        })
    }

    /// URL the user opens to grant `permission` for `ticket`.
    ///
    /// The signature covers exactly `api_key`, `perms` and `frob`.
    pub fn build_authorization_url(
        &self,
        ticket: &str,
        permission: Permission,
    ) -> Result<String, AuthError> {
        let mut url = Url::parse(self.client.auth_url()).map_err(|e| AuthError::InvalidEndpoint {
            message: e.to_string(),
        })?;

        let api_key = self.client.api_key();
        let signature = self.client.signer().sign([
            ("api_key", api_key),
            ("perms", permission.as_str()),
            ("frob", ticket),
        ]);

        url.query_pairs_mut()
            .append_pair("api_key", api_key)
            .append_pair("perms", permission.as_str())
            .append_pair("frob", ticket)
            .append_pair("api_sig", &signature);

        Ok(url.into())
    }

    /// Redeem `ticket` for a credential.
    ///
    /// On success the credential is written to every backend, installed on
    /// the client and the ticket is forgotten. On failure the ticket stays
    /// outstanding.
    pub async fn complete_authorization(
        &self,
        ticket: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletedAuthorization, AuthError> {
        let requested = self.tickets.lock().get(ticket).copied();
        if requested.is_none() {
            tracing::debug!("Redeeming a ticket this process did not issue");
        }

        let info = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            info = self.client.redeem_ticket(ticket) => info,
        };

        let info = match info {
            Ok(info) => info,
            Err(e) if e.is_ticket_rejection() => {
                tracing::warn!("Authorization ticket rejected; the user may not have granted access yet");
                return Err(AuthError::Abandoned {
                    ticket: ticket.to_string(),
                });
            }
            Err(e) => return Err(map_api_error(e)),
        };

        let permission = info.permission.or(requested).unwrap_or_default();
        let token = info.token.into_inner();
        let credential =
            Credential::new(token, info.user.id, info.user.username).with_permission(permission);

        let report = persist_credential(&credential, &self.backends).await;
        self.client.install_credential(credential.token.clone());
        self.tickets.lock().remove(ticket);

        tracing::info!(
            username = %credential.username,
            %permission,
            stores = report.written.len(),
            "Authorization completed",
        );

        Ok(CompletedAuthorization { credential, report })
    }

    /// Stop tracking `ticket`. Returns whether it was outstanding.
    pub fn discard_ticket(&self, ticket: &str) -> bool {
        let removed = self.tickets.lock().remove(ticket).is_some();
        if removed {
            tracing::debug!("Authorization ticket discarded");
        }
        removed
    }

    /// Tickets issued and not yet redeemed.
    pub fn pending_tickets(&self) -> Vec<AuthorizationTicket> {
        let mut tickets: Vec<_> = self
            .tickets
            .lock()
            .iter()
            .map(|(ticket, permission)| AuthorizationTicket {
                ticket: ticket.clone(),
                permission: *permission,
            })
            .collect();
        tickets.sort_by(|a, b| a.ticket.cmp(&b.ticket));
        tickets
    }
}

fn map_api_error(e: ApiError) -> AuthError {
    match e {
        ApiError::Cancelled => AuthError::Cancelled,
        other => AuthError::Api(other),
    }
}
