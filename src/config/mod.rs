//! Configuration Management
//!
//! Resolves the client settings (URI, database, pool sizing) used by the CLI.
//!
//! # Configuration Locations
//! - Local: `.docpool/config.json` (per-project, team-shareable)
//! - Global: `~/.config/docpool/config.json` (per-user)
//!
//! Both files share one format:
//! ```json
//! {
//!   "profiles": {
//!     "local": { "uri": "mongodb://localhost:27017", "database": "store" },
//!     "prod": { "uri_env": "PROD_MONGO_URI", "max_pool_size": 20 }
//!   },
//!   "default": "local"
//! }
//! ```
//! A local profile replaces a global profile of the same name; a local
//! `default` replaces the global one.
//!
//! # Resolution Precedence
//! 1. Command-line flags (`--uri`, `--database`)
//! 2. `DOCPOOL_URI` environment variable
//! 3. The selected profile (`--profile`, else the file's `default`)
//! 4. Built-in defaults
//!
//! Pool options in the URI (`maxPoolSize`, `waitQueueTimeoutMS`) override the
//! profile's pool fields.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::STORE_DATABASE;
use crate::error::{DocpoolError, Result};
use crate::pool::PoolOptions;
use crate::uri::{self, ConnectionConfig};

/// URI used when nothing else names one
pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// Environment variable overriding the profile URI
pub const URI_ENV: &str = "DOCPOOL_URI";

/// One named profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Environment variable holding the URI (if not storing it directly)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pool_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
}

impl StoredProfile {
    /// URI of this profile; `uri_env` wins over `uri`
    pub fn resolve_uri(&self) -> Result<Option<String>> {
        if let Some(env_var) = &self.uri_env {
            return match std::env::var(env_var) {
                Ok(uri) => Ok(Some(uri)),
                Err(_) => Err(DocpoolError::config_error(format!(
                    "Environment variable {env_var} not found for profile URI"
                ))),
            };
        }
        Ok(self.uri.clone())
    }
}

/// Contents of a config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRegistry {
    #[serde(default)]
    pub profiles: HashMap<String, StoredProfile>,

    /// Name of the default profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ProfileRegistry {
    /// Layer `local` over `self`
    #[must_use]
    pub fn merge(mut self, local: ProfileRegistry) -> Self {
        self.profiles.extend(local.profiles);
        if local.default.is_some() {
            self.default = local.default;
        }
        self
    }

    /// Profile named `name`, or the default profile when `name` is `None`
    ///
    /// No default and no name means no profile. A name that is not present is
    /// an error.
    pub fn select(&self, name: Option<&str>) -> Result<Option<&StoredProfile>> {
        let Some(name) = name.or(self.default.as_deref()) else {
            return Ok(None);
        };
        match self.profiles.get(name) {
            Some(profile) => Ok(Some(profile)),
            None => {
                let mut available: Vec<_> = self.profiles.keys().collect();
                available.sort();
                Err(DocpoolError::config_error(format!(
                    "Profile '{name}' not found. Available profiles: {available:?}"
                )))
            }
        }
    }
}

/// Get path to local config file (`.docpool/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        DocpoolError::config_error(format!("Could not determine current directory: {e}"))
    })?;
    Ok(current_dir.join(".docpool").join("config.json"))
}

/// Get path to global config file (`~/.config/docpool/config.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| DocpoolError::config_error("Could not determine user config directory"))?;
    Ok(config_dir.join("docpool").join("config.json"))
}

/// Load a config file; a missing file is an empty registry
pub fn load_registry(path: &Path) -> Result<ProfileRegistry> {
    if !path.exists() {
        return Ok(ProfileRegistry::default());
    }
    let contents = fs::read_to_string(path).map_err(|e| {
        DocpoolError::config_error(format!("Could not read config file {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        DocpoolError::config_error(format!("Invalid config file {}: {e}", path.display()))
    })
}

/// Load the global file, then the local file over it
pub fn load_with_precedence() -> Result<ProfileRegistry> {
    let global = match dirs::config_dir() {
        Some(_) => load_registry(&global_config_path()?)?,
        None => ProfileRegistry::default(),
    };
    let local = load_registry(&local_config_path()?)?;
    Ok(global.merge(local))
}

/// Values given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub uri: Option<String>,
    pub profile: Option<String>,
    pub database: Option<String>,
}

/// Fully resolved client settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub connection: ConnectionConfig,
    pub database: String,
    pub pool: PoolOptions,
}

impl ClientSettings {
    /// Resolve from the config files and the process environment
    pub fn load(overrides: &SettingsOverrides) -> Result<Self> {
        let registry = load_with_precedence()?;
        let env_uri = std::env::var(URI_ENV).ok().filter(|uri| !uri.trim().is_empty());
        Self::resolve(overrides, &registry, env_uri)
    }

    /// Resolve from explicit inputs
    pub fn resolve(
        overrides: &SettingsOverrides,
        registry: &ProfileRegistry,
        env_uri: Option<String>,
    ) -> Result<Self> {
        let profile = registry.select(overrides.profile.as_deref())?;
        let profile_uri = match profile {
            Some(profile) => profile.resolve_uri()?,
            None => None,
        };

        let uri = overrides
            .uri
            .clone()
            .or(env_uri)
            .or(profile_uri)
            .unwrap_or_else(|| DEFAULT_URI.to_string());
        let connection = uri::parse(&uri)?;

        let database = overrides
            .database
            .clone()
            .or_else(|| profile.and_then(|p| p.database.clone()))
            .or_else(|| connection.default_database.clone())
            .unwrap_or_else(|| STORE_DATABASE.to_string());

        let mut pool = PoolOptions::default();
        if let Some(profile) = profile {
            if let Some(max_size) = profile.max_pool_size {
                pool.max_size = max_size;
            }
            if let Some(timeout) = profile.acquire_timeout_ms {
                pool.acquire_timeout = Duration::from_millis(timeout);
            }
        }
        let pool = pool.with_config(&connection);
        if pool.max_size == 0 {
            return Err(DocpoolError::config_error("max pool size must be at least 1"));
        }

        Ok(Self { connection, database, pool })
    }
}
