//! Control Configuration
//!
//! Tunables for admission, handshake and health monitoring. Every field has
//! a default, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Maximum instances of one plugin key allowed to run at once
pub const MAX_RUNNING_PLUGINS: usize = 3;

/// How long a freshly started plugin has to answer its handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Period between health sweeps
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// How long a single health probe may take
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive failed probes before an instance is disabled
pub const HEALTH_CHECK_FAILURE_LIMIT: u32 = 3;

/// Control plane configuration (e.g. the `[control]` table of pulse.toml)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub max_running_plugins: usize,
    pub handshake_timeout_ms: u64,
    pub monitor_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub health_check_failure_limit: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_running_plugins: MAX_RUNNING_PLUGINS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL.as_secs(),
            health_check_timeout_ms: HEALTH_CHECK_TIMEOUT.as_millis() as u64,
            health_check_failure_limit: HEALTH_CHECK_FAILURE_LIMIT,
        }
    }
}

impl ControlConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("max_running_plugins", self.max_running_plugins as u64),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("health_check_failure_limit", self.health_check_failure_limit as u64),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);

        if let Some((field, _)) = zero {
            return Err(ConfigError::Invalid(format!("{field} must be greater than 0")));
        }

        // a probe must finish before the next sweep probes the same client
        if self.health_check_timeout() >= self.monitor_interval() {
            return Err(ConfigError::Invalid(format!(
                "health_check_timeout_ms ({}) must be shorter than monitor_interval_secs ({}s)",
                self.health_check_timeout_ms, self.monitor_interval_secs
            )));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ControlConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControlConfig::default());
        assert_eq!(config.max_running_plugins, 3);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.monitor_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_override() {
        let config = ControlConfig::from_toml_str(
            r#"
            max_running_plugins = 5
            monitor_interval_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.max_running_plugins, 5);
        assert_eq!(config.monitor_interval(), Duration::from_secs(10));
        assert_eq!(config.health_check_failure_limit, HEALTH_CHECK_FAILURE_LIMIT);
    }

    #[test]
    fn test_zero_is_rejected() {
        let err = ControlConfig::from_toml_str("handshake_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("handshake_timeout_ms")));
    }

    #[test]
    fn test_probe_timeout_must_fit_in_interval() {
        let err = ControlConfig::from_toml_str(
            r#"
            monitor_interval_secs = 1
            health_check_timeout_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("health_check_timeout_ms")));

        let ok = ControlConfig::from_toml_str(
            r#"
            monitor_interval_secs = 1
            health_check_timeout_ms = 999
            "#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_bad_type_is_parse_error() {
        let err = ControlConfig::from_toml_str("max_running_plugins = \"three\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "health_check_failure_limit = 5").unwrap();

        let config = ControlConfig::load(file.path()).unwrap();
        assert_eq!(config.health_check_failure_limit, 5);

        let missing = ControlConfig::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
