mod broker;
mod logging;

pub use broker::{BrokerConfig, ReceiverConfig};
pub use logging::LoggingConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TestyError};

/// Environment variable naming the config file read by [`TestyConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "TESTY_CONFIG";

/// Root configuration for testy fixtures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestyConfig {
    /// In-process broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Mocked receiver configuration.
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TestyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TestyError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        let config: Self = toml::from_str(&content)
            .map_err(|e| TestyError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `TESTY_CONFIG`, or defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.broker.queue_capacity == 0 {
            return Err(TestyError::Config(
                "broker.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") else {
        return result;
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_err_variant;

    #[test]
    fn test_default_config() {
        let config = TestyConfig::default();
        assert_eq!(config.broker.virtual_host, "/");
        assert_eq!(config.broker.queue_capacity, 10_000);
        assert_eq!(config.receiver.default_timeout_ms, 500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = TestyConfig::parse_toml("").unwrap();
        assert_eq!(config.receiver.default_timeout_ms, 500);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [broker]
            virtual_host = "/tests"
            queue_capacity = 16

            [receiver]
            default_timeout_ms = 2000

            [logging]
            level = "debug"
            json_format = true
        "#;

        let config = TestyConfig::parse_toml(toml).unwrap();
        assert_eq!(config.broker.virtual_host, "/tests");
        assert_eq!(config.broker.queue_capacity, 16);
        assert_eq!(
            config.receiver.default_timeout(),
            std::time::Duration::from_millis(2000)
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let toml = r#"
            [broker]
            queue_capacity = 0
        "#;

        let result = TestyConfig::parse_toml(toml);
        assert_err_variant!(result, TestyError::Config(_));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TESTY_TEST_VHOST", "/from-env");

        let toml = r#"
            [broker]
            virtual_host = "${TESTY_TEST_VHOST}"
        "#;

        let config = TestyConfig::parse_toml(toml).unwrap();
        assert_eq!(config.broker.virtual_host, "/from-env");

        std::env::remove_var("TESTY_TEST_VHOST");
    }

    #[test]
    fn test_unknown_env_var_left_untouched() {
        let content = substitute_env_vars("level = \"${TESTY_SURELY_NOT_SET}\"");
        assert_eq!(content, "level = \"${TESTY_SURELY_NOT_SET}\"");
    }
}
