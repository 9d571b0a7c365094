//! Provider configuration
//!
//! Execution classes are configured as `{class: dispatch policy}`:
//!
//! ```toml
//! [provider]
//! name = "bus0"
//! version = 2
//!
//! [pool]
//! max_outstanding = 256
//!
//! [queues.critical]
//! workers = 2
//! capacity = 128
//!
//! [queues.delayed]
//! workers = 4
//! capacity = 512
//!
//! [facade]
//! default_queue = "delayed"
//! ```

use anyhow::{Result, anyhow};
use interface::{CURRENT_VERSION, InterfaceVersion, QueueType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub queues: QueueSettings,
    #[serde(default)]
    pub facade: FacadeSettings,
}

/// Provider identity and offered revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Name used in logs
    #[serde(default = "ProviderSettings::default_name")]
    pub name: String,
    /// Interface revision to offer; lower it to serve older consumers
    #[serde(default = "ProviderSettings::default_version")]
    pub version: InterfaceVersion,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

impl ProviderSettings {
    fn default_name() -> String {
        "bus0".to_string()
    }

    fn default_version() -> InterfaceVersion {
        CURRENT_VERSION
    }
}

/// Work item pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum work items allocated at once
    #[serde(default = "PoolSettings::default_max_outstanding")]
    pub max_outstanding: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_outstanding: Self::default_max_outstanding(),
        }
    }
}

impl PoolSettings {
    fn default_max_outstanding() -> usize {
        256
    }
}

/// Dispatch policy for one execution class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSettings {
    /// Dedicated worker threads draining the lane
    pub workers: usize,
    /// Work items that may wait in the lane before queuing is rejected
    pub capacity: usize,
}

/// Dispatch policy per execution class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "QueueSettings::default_critical")]
    pub critical: LaneSettings,
    #[serde(default = "QueueSettings::default_delayed")]
    pub delayed: LaneSettings,
    #[serde(default = "QueueSettings::default_hyper_critical")]
    pub hyper_critical: LaneSettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            critical: Self::default_critical(),
            delayed: Self::default_delayed(),
            hyper_critical: Self::default_hyper_critical(),
        }
    }
}

impl QueueSettings {
    fn default_critical() -> LaneSettings {
        LaneSettings {
            workers: 2,
            capacity: 128,
        }
    }

    fn default_delayed() -> LaneSettings {
        LaneSettings {
            workers: 4,
            capacity: 512,
        }
    }

    fn default_hyper_critical() -> LaneSettings {
        LaneSettings {
            workers: 1,
            capacity: 32,
        }
    }

    /// Settings for one execution class
    pub fn lane(&self, queue_type: QueueType) -> &LaneSettings {
        match queue_type {
            QueueType::Critical => &self.critical,
            QueueType::Delayed => &self.delayed,
            QueueType::HyperCritical => &self.hyper_critical,
        }
    }
}

/// Deferred request processing settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacadeSettings {
    /// Execution class used by `defer_request_processing`
    #[serde(default)]
    pub default_queue: QueueType,
}

impl ProviderConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.provider.version < InterfaceVersion::V1 || self.provider.version > CURRENT_VERSION {
            return Err(anyhow!(
                "provider.version must be between {} and {}, got {}",
                InterfaceVersion::V1,
                CURRENT_VERSION,
                self.provider.version
            ));
        }

        if self.pool.max_outstanding == 0 {
            return Err(anyhow!("pool.max_outstanding must be at least 1"));
        }

        for queue_type in QueueType::ALL {
            let lane = self.queues.lane(queue_type);
            if lane.workers == 0 {
                return Err(anyhow!("queues.{}.workers must be at least 1", queue_type));
            }
            if lane.capacity == 0 {
                return Err(anyhow!("queues.{}.capacity must be at least 1", queue_type));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProviderConfig::default();
        assert_eq!(config.provider.version, CURRENT_VERSION);
        assert_eq!(config.pool.max_outstanding, 256);
        assert_eq!(config.queues.delayed.workers, 4);
        assert_eq!(config.facade.default_queue, QueueType::Delayed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ProviderConfig = toml::from_str(
            r#"
[queues.critical]
workers = 8
capacity = 16

[facade]
default_queue = "critical"
"#,
        )
        .unwrap();

        assert_eq!(config.queues.critical.workers, 8);
        assert_eq!(config.queues.lane(QueueType::Critical).capacity, 16);
        assert_eq!(config.queues.delayed, QueueSettings::default_delayed());
        assert_eq!(config.pool.max_outstanding, 256);
        assert_eq!(config.facade.default_queue, QueueType::Critical);
    }

    #[test]
    fn test_validate_rejects_empty_lane() {
        let mut config = ProviderConfig::default();
        config.queues.hyper_critical.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hyper_critical"));

        let mut config = ProviderConfig::default();
        config.queues.delayed.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let mut config = ProviderConfig::default();
        config.provider.version = InterfaceVersion(7);
        assert!(config.validate().is_err());

        config.provider.version = InterfaceVersion::V1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let mut config = ProviderConfig::default();
        config.pool.max_outstanding = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = ProviderConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ProviderConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.queues.critical, config.queues.critical);
        assert_eq!(parsed.pool.max_outstanding, config.pool.max_outstanding);
    }
}
