//! # milkauth core
//!
//! Credential acquisition, verification and persistence for the Remember The
//! Milk REST API.
//!
//! This crate provides:
//! - Credential stores backed by the OS keyring, an owner-only JSON file, or memory
//! - Request signing and a shared, signing HTTP client
//! - Discovery of existing credentials with remote verification
//! - The ticket-based authorization handshake
//! - A cancellation-aware retry executor
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use milkauth_core::{AuthConfig, Authenticator};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn connect(config: AuthConfig) -> Result<(), milkauth_core::MilkauthError> {
//!     let cancel = CancellationToken::new();
//!     let auth = Authenticator::new(config, &cancel).await?;
//!     let status = auth.initialize(&cancel).await?;
//!     if !status.authenticated {
//!         println!("Open {} to grant access", status.authorization_url.unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod retry;
pub mod session;
pub mod signing;
pub mod store;

// Re-export commonly used types at crate root
pub use model::{
    AuthStatus,
    AuthorizationTicket,
    Credential,
    CredentialSource,
    Permission,
};

pub use store::{
    CredentialStore,
    FileStore,
    MemoryStore,
    Secret,
    StoreError,
    StoreProbeResult,
    persistence_backends,
    select_store,
};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use config::{AuthConfig, DiscoveryConfig, StoreConfig};

pub use retry::{Backoff, RetryError, RetryExecutor, RetryPolicy};

pub use signing::RequestSigner;

pub use client::{ApiError, AuthInfo, RemoteUser, RtmClient};

pub use discovery::{
    CredentialDiscovery,
    DiscoveredCredential,
    DiscoveryError,
    PersistReport,
    persist_credential,
};

pub use authorization::{AuthError, AuthorizationFlow, CompletedAuthorization, TicketGrant};

pub use session::Authenticator;

pub use error::MilkauthError;
