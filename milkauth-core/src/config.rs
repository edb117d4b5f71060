//! Configuration for the authentication subsystem.
//!
//! Every knob that used to be a hard-coded constant (endpoints, search paths,
//! the shared signing secret, keyring names) is carried here and handed to
//! constructors. The structs deserialize with defaults, so a host application
//! can embed them in its own config file and only override what it needs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Permission;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{Secret, StoreError};

/// REST endpoint of the remote service.
pub const DEFAULT_REST_URL: &str = "https://api.rememberthemilk.com/services/rest/";

/// Endpoint users open to grant access.
pub const DEFAULT_AUTH_URL: &str = "https://www.rememberthemilk.com/services/auth/";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Application key issued by the remote service.
    pub api_key: String,

    /// Shared secret used to sign requests.
    pub shared_secret: Secret,

    /// REST endpoint.
    pub rest_url: String,

    /// Authorization endpoint.
    pub auth_url: String,

    /// Permission requested by interactive authorization.
    pub permission: Permission,

    /// Per-request timeout for remote calls, in seconds.
    pub request_timeout_secs: u64,

    /// Attempts for remote verification when the network misbehaves.
    pub verify_attempts: u32,

    /// Base delay between verification attempts, in milliseconds.
    pub verify_backoff_ms: u64,

    pub discovery: DiscoveryConfig,

    pub store: StoreConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            shared_secret: Secret::new(""),
            rest_url: DEFAULT_REST_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            permission: Permission::default(),
            request_timeout_secs: 30,
            verify_attempts: 3,
            verify_backoff_ms: 500,
            discovery: DiscoveryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Create a configuration with the given application credentials.
    pub fn new(api_key: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            shared_secret: Secret::new(shared_secret),
            ..Self::default()
        }
    }

    /// Point both endpoints at a different host (used by tests and proxies).
    pub fn with_endpoints(mut self, rest_url: impl Into<String>, auth_url: impl Into<String>) -> Self {
        self.rest_url = rest_url.into();
        self.auth_url = auth_url.into();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Retry policy applied to remote credential verification.
    pub fn verify_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.verify_attempts.max(1),
            base_delay: Duration::from_millis(self.verify_backoff_ms),
            backoff: Backoff::Linear,
        }
    }

    /// Whether the application credentials needed for signing are present.
    pub fn has_application_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.shared_secret.expose().is_empty()
    }
}

/// Where discovery looks for an existing credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Environment variables checked first, in order.
    pub env_vars: Vec<String>,

    /// File names searched in the working directory, then the home directory.
    pub file_names: Vec<String>,

    /// Dotted configuration directory under the home directory.
    pub config_subdir: PathBuf,

    /// File name inside `config_subdir`.
    pub config_file_name: String,

    /// Directory used for relative file names. Defaults to the process
    /// working directory.
    pub working_dir: Option<PathBuf>,

    /// Home directory override. Defaults to the user's home directory.
    pub home_dir: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            env_vars: vec!["RTM_AUTH_TOKEN".to_string(), "RTM_TOKEN".to_string()],
            file_names: vec!["rtm_token.json".to_string(), ".rtm_token.json".to_string()],
            config_subdir: PathBuf::from(".config").join("milkauth"),
            config_file_name: "token.json".to_string(),
            working_dir: None,
            home_dir: None,
        }
    }
}

impl DiscoveryConfig {
    /// Credential files in search order: working directory, home directory,
    /// then the dotted configuration subdirectory.
    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        let working_dir = self
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok());
        let home_dir = self
            .home_dir
            .clone()
            .or_else(|| directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()));

        let mut paths = Vec::new();

        if let Some(dir) = &working_dir {
            paths.extend(self.file_names.iter().map(|name| dir.join(name)));
        }

        if let Some(home) = &home_dir {
            paths.extend(self.file_names.iter().map(|name| home.join(name)));
            paths.push(home.join(&self.config_subdir).join(&self.config_file_name));
        }

        // The working directory may be the home directory.
        let mut seen = std::collections::HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));
        paths
    }
}

/// Credential store selection and naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Try the OS keyring before falling back to a file.
    pub prefer_keyring: bool,

    /// Keyring service name.
    pub keyring_service: String,

    /// Keyring account name.
    pub keyring_account: String,

    /// Credential file path. Defaults to the platform config directory.
    pub file_path: Option<PathBuf>,

    /// Also write credentials to the file store when the keyring is primary.
    pub mirror_to_file: bool,

    /// Upper bound for a single secret-store call, in seconds.
    pub operation_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefer_keyring: true,
            keyring_service: "milkauth".to_string(),
            keyring_account: "default".to_string(),
            file_path: None,
            mirror_to_file: false,
            operation_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }

    /// Resolve the credential file path.
    ///
    /// Falls back to `<config dir>/milkauth/token.json`.
    pub fn resolved_file_path(&self) -> Result<PathBuf, StoreError> {
        if let Some(path) = &self.file_path {
            return Ok(path.clone());
        }

        let dirs = directories::ProjectDirs::from("com", "milkauth", "milkauth").ok_or_else(|| {
            StoreError::Config {
                message: "no home directory available for the credential file".to_string(),
            }
        })?;

        Ok(dirs.config_dir().join("token.json"))
    }
}
