//! Hub configuration management

use anyhow::{Context, Result, anyhow};
use interface::{CURRENT_VERSION, InterfaceVersion, QueueType};
use provider::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub hub: HubSettings,
    /// Bus provider the hub is wired to
    #[serde(default)]
    pub bus: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "HubSettings::default_name")]
    pub name: String,
    #[serde(default = "HubSettings::default_log_level")]
    pub log_level: String,
    /// Downstream port count
    #[serde(default = "HubSettings::default_ports")]
    pub ports: u8,
    /// Highest interface revision the hub asks for
    #[serde(default = "HubSettings::default_requested_version")]
    pub requested_version: InterfaceVersion,
    /// Execution class used when composing allocate and queue against a
    /// version 1 provider
    #[serde(default = "HubSettings::default_queue")]
    pub queue: QueueType,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            log_level: Self::default_log_level(),
            ports: Self::default_ports(),
            requested_version: Self::default_requested_version(),
            queue: Self::default_queue(),
        }
    }
}

impl HubSettings {
    fn default_name() -> String {
        "hub0".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_ports() -> u8 {
        4
    }

    fn default_requested_version() -> InterfaceVersion {
        CURRENT_VERSION
    }

    fn default_queue() -> QueueType {
        QueueType::Critical
    }
}

impl HubConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/fwdprog/hub.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HubConfig = toml::from_str(&content)
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
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
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
            config_dir.join("fwdprog").join("hub.toml")
        } else {
            PathBuf::from(".config/fwdprog/hub.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.hub.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.hub.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.hub.name.is_empty() {
            return Err(anyhow!("hub.name must not be empty"));
        }

        if self.hub.ports == 0 {
            return Err(anyhow!("hub.ports must be at least 1"));
        }

        if self.hub.requested_version < InterfaceVersion::V1 {
            return Err(anyhow!(
                "hub.requested_version must be at least {}",
                InterfaceVersion::V1
            ));
        }

        self.bus.validate().context("Invalid bus configuration")
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
