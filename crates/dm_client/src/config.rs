//! Client configuration.
//!
//! Resolution order: built-in defaults, then the JSON config file (if any),
//! then environment overrides:
//!   DM_E2EE_API_URL    key-directory base URL
//!   DM_E2EE_API_TOKEN  bearer token for the directory
//!   DM_E2EE_DATA_DIR   directory holding the database

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use dm_crypto::{ChainPolicy, SessionConfig};

use crate::error::E2eeError;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "dm-e2ee";
pub const APP_NAME: &str = "dm-e2ee";

pub const ENV_API_URL: &str = "DM_E2EE_API_URL";
pub const ENV_API_TOKEN: &str = "DM_E2EE_API_TOKEN";
pub const ENV_DATA_DIR: &str = "DM_E2EE_DATA_DIR";

const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "dm-e2ee.db";

/// Largest skip window accepted from a config file.
const MAX_SKIP_CEILING: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub fetch_timeout_secs: u64,
    pub chain_policy: ChainPolicy,
    pub max_skip: u32,
    pub one_time_prekey_batch: u32,
    pub signed_prekey_max_age_days: i64,
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000/api".to_string(),
            api_token: None,
            fetch_timeout_secs: 10,
            chain_policy: ChainPolicy::Advancing,
            max_skip: dm_crypto::ratchet::DEFAULT_MAX_SKIP,
            one_time_prekey_batch: 20,
            signed_prekey_max_age_days: 7,
            data_dir: None,
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf, E2eeError> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| E2eeError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

impl ClientConfig {
    /// Load from `path`, or from `<data dir>/config.json` when no path is
    /// given. An explicit path must exist; the default one may not.
    pub fn load(path: Option<&Path>) -> Result<Self, E2eeError> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => {
                let dir = Self::env_data_dir().map_or_else(default_data_dir, Ok)?;
                (dir.join(CONFIG_FILE), false)
            }
        };

        let mut config = match std::fs::read_to_string(&file) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| E2eeError::Config(format!("{}: {e}", file.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Self::default(),
            Err(e) => return Err(E2eeError::Config(format!("{}: {e}", file.display()))),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        tracing::debug!(config = %file.display(), api = %config.api_base_url, "configuration loaded");
        Ok(config)
    }

    fn env_data_dir() -> Option<PathBuf> {
        std::env::var_os(ENV_DATA_DIR).map(PathBuf::from)
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(token) = var(ENV_API_TOKEN) {
            self.api_token = Some(token);
        }
        if let Some(dir) = var(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), E2eeError> {
        if self.api_base_url.trim().is_empty() {
            return Err(E2eeError::Config("api_base_url is empty".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(E2eeError::Config("fetch_timeout_secs must be positive".into()));
        }
        if self.max_skip > MAX_SKIP_CEILING {
            return Err(E2eeError::Config(format!(
                "max_skip must be at most {MAX_SKIP_CEILING}"
            )));
        }
        if self.signed_prekey_max_age_days <= 0 {
            return Err(E2eeError::Config(
                "signed_prekey_max_age_days must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf, E2eeError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf, E2eeError> {
        Ok(self.data_dir()?.join(DB_FILE))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            policy: self.chain_policy,
            max_skip: self.max_skip,
        }
    }

    pub fn signed_prekey_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.signed_prekey_max_age_days)
    }
}
