//! Domain model types for milkauth.
//!
//! This module defines the core types used throughout milkauth:
//! - [`Credential`] - A persisted API credential with its owner and timestamps
//! - [`Permission`] - Access level granted to a credential
//! - [`AuthorizationTicket`] - An outstanding authorization handshake
//! - [`CredentialSource`] - Where a usable credential was found
//! - [`AuthStatus`] - The authentication state reported to collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::store::Secret;

/// Access level a credential grants on the remote service.
///
/// Levels are ordered: `Delete` implies `Write`, which implies `Read`.
///
/// # Examples
///
/// ```
/// use milkauth_core::Permission;
///
/// let perm: Permission = "DELETE".parse().unwrap();
/// assert!(perm.allows(Permission::Write));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    #[default]
    Delete,
}

impl Permission {
    /// Wire representation used in the `perms` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
        }
    }

    /// Whether this level covers `other`.
    pub fn allows(&self, other: Permission) -> bool {
        *self >= other
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a permission string is not one of `read`, `write`, `delete`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown permission level: {0}")]
pub struct ParsePermissionError(pub String);

impl FromStr for Permission {
    type Err = ParsePermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "delete" => Ok(Permission::Delete),
            other => Err(ParsePermissionError(other.to_string())),
        }
    }
}

/// A credential for the remote task service.
///
/// This is the record persisted by every [`CredentialStore`](crate::CredentialStore)
/// and read back from credential files during discovery. The JSON field names
/// are fixed so files written by other tools stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// The opaque bearer token.
    pub token: Secret,

    /// Remote user identifier.
    #[serde(rename = "userID")]
    pub user_id: String,

    /// Remote username.
    pub username: String,

    /// When the credential was first stored.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// When the credential was last written.
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    /// Permission level granted, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<Permission>,
}

impl Credential {
    /// Create a credential stamped with the current time.
    pub fn new(
        token: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            token: Secret::new(token),
            user_id: user_id.into(),
            username: username.into(),
            created_at: now,
            updated_at: now,
            permission: None,
        }
    }

    /// Attach the granted permission level.
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = Some(permission);
        self
    }

    /// Keep the creation time of an earlier record of the same credential slot.
    ///
    /// `updated_at` is never moved before `created_at`.
    pub fn preserving_created_at(mut self, previous: &Credential) -> Self {
        self.created_at = previous.created_at.min(self.updated_at);
        self
    }

    /// A stored record is usable only when it carries a token.
    pub fn has_token(&self) -> bool {
        !self.token.expose().trim().is_empty()
    }
}

/// An authorization handshake waiting to be redeemed.
///
/// Held in memory only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationTicket {
    pub ticket: String,
    pub permission: Permission,
}

/// Where a usable credential came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CredentialSource {
    /// An environment variable, by name.
    Environment(String),
    /// A configured credential store, by store name.
    Store(String),
    /// A credential file on disk.
    File(PathBuf),
    /// A completed interactive authorization.
    Authorization,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Environment(name) => write!(f, "environment variable {}", name),
            CredentialSource::Store(name) => write!(f, "{} store", name),
            CredentialSource::File(path) => write!(f, "file {}", path.display()),
            CredentialSource::Authorization => write!(f, "interactive authorization"),
        }
    }
}

/// Authentication state exposed to the rest of the system.
///
/// When `authenticated` is false, `authorization_url` carries a link the user
/// can open to grant access, if one could be issued, and `ticket` names the
/// ticket to redeem once access is granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub permission: Option<Permission>,
    pub source: Option<CredentialSource>,
    pub authorization_url: Option<String>,
    pub ticket: Option<String>,
}

impl AuthStatus {
    /// Status for a verified credential.
    pub fn authenticated(credential: &Credential, source: CredentialSource) -> Self {
        Self {
            authenticated: true,
            username: Some(credential.username.clone()),
            user_id: Some(credential.user_id.clone()),
            permission: credential.permission,
            source: Some(source),
            authorization_url: None,
            ticket: None,
        }
    }

    /// Status when no usable credential is available.
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// Unauthenticated, with a ticket issued and waiting for the user.
    pub fn awaiting_authorization(ticket: impl Into<String>, authorization_url: impl Into<String>) -> Self {
        Self {
            authorization_url: Some(authorization_url.into()),
            ticket: Some(ticket.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_permission_parse_and_order() {
        assert_eq!("Read".parse::<Permission>().unwrap(), Permission::Read);
        assert_eq!(" write ".parse::<Permission>().unwrap(), Permission::Write);
        assert!("admin".parse::<Permission>().is_err());

        assert!(Permission::Delete.allows(Permission::Read));
        assert!(Permission::Write.allows(Permission::Write));
        assert!(!Permission::Read.allows(Permission::Write));
    }

    #[test]
    fn test_credential_json_field_names() {
        let credential = Credential::new("tok", "42", "alice");
        let json = serde_json::to_value(&credential).unwrap();

        assert_eq!(json["token"], "tok");
        assert_eq!(json["userID"], "42");
        assert_eq!(json["username"], "alice");
        assert!(json["createdAt"].is_string());
        assert!(json["updatedAt"].is_string());
        assert!(json.get("permission").is_none());
    }

    #[test]
    fn test_credential_parses_rfc3339_record() {
        let raw = r#"{
            "token": "abc",
            "userID": "7",
            "username": "bob",
            "createdAt": "2024-01-02T03:04:05Z",
            "updatedAt": "2024-02-03T04:05:06Z"
        }"#;

        let credential: Credential = serde_json::from_str(raw).unwrap();
        assert_eq!(credential.token.expose(), "abc");
        assert_eq!(credential.user_id, "7");
        assert!(credential.updated_at >= credential.created_at);
        assert!(credential.permission.is_none());
    }

    #[test]
    fn test_preserving_created_at() {
        let mut old = Credential::new("old", "1", "alice");
        old.created_at = Utc::now() - Duration::days(3);

        let fresh = Credential::new("new", "1", "alice").preserving_created_at(&old);
        assert_eq!(fresh.created_at, old.created_at);
        assert!(fresh.updated_at >= fresh.created_at);
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let credential = Credential::new("very-secret", "1", "alice");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_awaiting_authorization_status_names_ticket() {
        let status = AuthStatus::awaiting_authorization("frob-9", "https://example.test/auth?frob=frob-9");
        assert!(!status.authenticated);
        assert_eq!(status.ticket.as_deref(), Some("frob-9"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["ticket"], "frob-9");
        assert!(AuthStatus::unauthenticated().ticket.is_none());
    }

    #[test]
    fn test_has_token() {
        assert!(Credential::new("x", "1", "a").has_token());
        assert!(!Credential::new("  ", "1", "a").has_token());
    }
}
