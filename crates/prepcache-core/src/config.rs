//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which includes
//! the remote service endpoint, the last signed-in user and the sync timings.
//!
//! Configuration is stored at `~/.config/prepcache/config.json`. Environment
//! variables override the file (see `Config::apply_env`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "prepcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_SUPABASE_URL: &str = "PREPCACHE_SUPABASE_URL";
const ENV_ANON_KEY: &str = "PREPCACHE_ANON_KEY";
const ENV_USER_ID: &str = "PREPCACHE_USER_ID";

/// Interval between change checks while online.
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// Delay after sign-in so startup work settles before the first sync.
const DEFAULT_LOGIN_DELAY_SECS: u64 = 3;

/// Delay after reconnecting so the network can stabilize.
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    pub last_user_id: Option<String>,
    #[serde(default)]
    pub encrypt_cache: bool,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Timer settings for the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub check_interval_secs: u64,
    pub login_delay_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            login_delay_secs: DEFAULT_LOGIN_DELAY_SECS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
        }
    }
}

impl SyncSettings {
    pub fn check_interval(&self) -> Duration {
        // A zero interval would spin the timer
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn login_delay(&self) -> Duration {
        Duration::from_secs(self.login_delay_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override file values with environment variables when present
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_SUPABASE_URL) {
            self.supabase_url = Some(url);
        }
        if let Some(key) = non_empty(ENV_ANON_KEY) {
            self.anon_key = Some(key);
        }
        if let Some(user) = non_empty(ENV_USER_ID) {
            self.last_user_id = Some(user);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Root of all per-user cache directories
    pub fn cache_root() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Cache directory for a single user
    pub fn cache_dir(&self, user_id: &str) -> Result<PathBuf> {
        Ok(Self::cache_root()?.join(user_id))
    }
}
