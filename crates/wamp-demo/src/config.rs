//! Demo configuration at `~/.wamp-demo/config.toml`.
//!
//! Every value has a default; command-line flags override the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

/// Where and how to reach the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// `ws://`, `wss://`, `tcp://` or `rs://` URL.
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_realm")]
    pub realm: String,

    /// "json" or "cbor".
    #[serde(default = "default_serializer")]
    pub serializer: String,

    /// Reconnect rounds before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            realm: default_realm(),
            serializer: default_serializer(),
            max_retries: default_max_retries(),
        }
    }
}

/// Behavior of the example component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Seconds between call/publish rounds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Second operand passed to `com.example.add2`.
    #[serde(default = "default_addend")]
    pub addend: i64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            addend: default_addend(),
        }
    }
}

impl DemoConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_realm() -> String {
    "realm1".to_string()
}

fn default_serializer() -> String {
    "json".to_string()
}

fn default_max_retries() -> u32 {
    15
}

fn default_interval() -> u64 {
    2
}

fn default_addend() -> i64 {
    3
}

/// Default config location in the user's home directory.
pub fn default_path() -> String {
    let home = dirs::home_dir().unwrap_or_default();
    home.join(".wamp-demo")
        .join("config.toml")
        .to_string_lossy()
        .to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
