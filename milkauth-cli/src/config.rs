//! CLI configuration handling.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use milkauth_core::{AuthConfig, Secret};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_API_KEY: &str = "RTM_API_KEY";
pub const ENV_SHARED_SECRET: &str = "RTM_SHARED_SECRET";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Logging level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Authentication settings, the `[auth]` table.
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            log_level: default_log_level(),
            auth: AuthConfig::default(),
        }
    }
}

impl CliConfig {
    /// Let the environment override the application credentials.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = env(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.auth.api_key = key;
        }
        if let Some(secret) = env(ENV_SHARED_SECRET).filter(|v| !v.is_empty()) {
            self.auth.shared_secret = Secret::new(secret);
        }
    }
}

/// Load configuration from `path`, or the default location, or defaults.
///
/// An explicitly given path must exist.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let config_path = match path {
        Some(path) => {
            anyhow::ensure!(path.exists(), "Config file {:?} does not exist", path);
            path.to_path_buf()
        }
        None => default_config_path(),
    };

    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        CliConfig::default()
    };

    config.config_path = config_path;
    config.apply_env(|name| std::env::var(name).ok());

    Ok(config)
}

fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("milkauth.toml"))
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "milkauth", "milkauth")
}

#[cfg(test)]
mod tests {
    use super::*;
    use milkauth_core::Permission;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[auth]
api_key = "abc"
shared_secret = "xyz"
permission = "read"

[auth.store]
prefer_keyring = false
mirror_to_file = true
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.config_path, path);
        assert_eq!(config.auth.permission, Permission::Read);
        assert!(!config.auth.store.prefer_keyring);
        assert!(config.auth.store.mirror_to_file);
        assert_eq!(config.auth.discovery.env_vars, vec!["RTM_AUTH_TOKEN", "RTM_TOKEN"]);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(load_config(Some(&temp.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "log_level = [").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_env_overrides_application_credentials() {
        let mut config = CliConfig::default();
        config.auth.api_key = "from-file".to_string();

        let env = HashMap::from([(ENV_API_KEY, "from-env"), (ENV_SHARED_SECRET, "s3cret")]);
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.auth.api_key, "from-env");
        assert_eq!(config.auth.shared_secret.expose(), "s3cret");
    }

    #[test]
    fn test_empty_env_does_not_override() {
        let mut config = CliConfig::default();
        config.auth.api_key = "from-file".to_string();

        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.auth.api_key, "from-file");
    }
}
