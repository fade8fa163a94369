//! Server configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address both servers bind to
    #[serde(default = "ServerSettings::default_host")]
    pub host: String,
    /// TCP port of the HTTP control endpoint
    #[serde(default = "ServerSettings::default_rest_port")]
    pub rest_port: u16,
    /// TCP port of the INDI protocol server
    #[serde(default = "ServerSettings::default_indi_port")]
    pub indi_port: u16,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            rest_port: Self::default_rest_port(),
            indi_port: Self::default_indi_port(),
            log_level: Self::default_log_level(),
        }
    }
}

impl ServerSettings {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_rest_port() -> u16 {
        80
    }

    fn default_indi_port() -> u16 {
        7624
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Bound on a single control transfer or driver reset, milliseconds
    #[serde(default = "UsbSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a topology snapshot may serve listings, milliseconds
    #[serde(default = "UsbSettings::default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            cache_ttl_ms: Self::default_cache_ttl_ms(),
        }
    }
}

impl UsbSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }

    fn default_cache_ttl_ms() -> u64 {
        1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbwatch/usbwatch.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbwatch").join("usbwatch.toml")
        } else {
            PathBuf::from(".config/usbwatch/usbwatch.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.timeout_ms == 0 {
            return Err(anyhow!("usb.timeout_ms must be greater than zero"));
        }

        Ok(())
    }
}
