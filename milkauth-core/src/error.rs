//! Top-level error types for milkauth.

use thiserror::Error;

use crate::authorization::AuthError;
use crate::client::ApiError;
use crate::discovery::DiscoveryError;
use crate::store::StoreError;

/// Top-level error type encompassing all milkauth errors.
#[derive(Debug, Error)]
pub enum MilkauthError {
    /// Error from credential storage operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from a remote call.
    #[error("remote error: {0}")]
    Api(#[from] ApiError),

    /// Error from credential discovery.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Error from the authorization handshake.
    #[error("authorization error: {0}")]
    Auth(#[from] AuthError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Generic internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}
