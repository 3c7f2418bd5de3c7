//! Bridge configuration (tandem.toml)
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Environment variables override file values:
//!
//! ```text
//! TANDEM_TRACE_DUMP_MS         trace_dump_interval_ms
//! TANDEM_DISPATCH_RETRY_MS     dispatch.retry_interval_ms
//! TANDEM_DISPATCH_CEILING_MS   dispatch.ceiling_ms
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment switch for the periodic stack logger.
pub const ENV_TRACE_DUMP_MS: &str = "TANDEM_TRACE_DUMP_MS";
pub const ENV_DISPATCH_RETRY_MS: &str = "TANDEM_DISPATCH_RETRY_MS";
pub const ENV_DISPATCH_CEILING_MS: &str = "TANDEM_DISPATCH_CEILING_MS";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is out of range or malformed
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interval of the guest stack logger; 0 disables it.
    pub trace_dump_interval_ms: u64,

    /// Cross-thread dispatch policy
    pub dispatch: DispatchConfig,

    /// Nesting limit for guest → host callbacks
    pub max_callback_depth: usize,

    /// Appended to every translated guest exception message
    pub error_hint: String,
}

/// Retry policy for scheduling work on the host thread
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sleep between enqueue attempts
    pub retry_interval_ms: u64,

    /// How often a liveness warning is logged while retrying
    pub warn_interval_ms: u64,

    /// Give up and drop the call after this long
    pub ceiling_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trace_dump_interval_ms: 0,
            dispatch: DispatchConfig::default(),
            max_callback_depth: 512,
            error_hint: "Run `last_error()` for details.".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 100,
            warn_interval_ms: 60_000,
            ceiling_ms: 120_000,
        }
    }
}

impl DispatchConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn warn_interval(&self) -> Duration {
        Duration::from_millis(self.warn_interval_ms)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(ms) = parse_millis(&lookup, ENV_TRACE_DUMP_MS)? {
            self.trace_dump_interval_ms = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_DISPATCH_RETRY_MS)? {
            self.dispatch.retry_interval_ms = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_DISPATCH_CEILING_MS)? {
            self.dispatch.ceiling_ms = ms;
        }
        self.validate()
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.retry_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.dispatch.warn_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.warn_interval_ms must be positive".to_string(),
            ));
        }
        if self.dispatch.ceiling_ms < self.dispatch.retry_interval_ms {
            return Err(ConfigError::ValidationError(format!(
                "dispatch.ceiling_ms ({}) is shorter than the retry interval ({})",
                self.dispatch.ceiling_ms, self.dispatch.retry_interval_ms
            )));
        }
        if self.max_callback_depth == 0 {
            return Err(ConfigError::ValidationError(
                "max_callback_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Stack logger interval, if enabled.
    pub fn trace_dump_interval(&self) -> Option<Duration> {
        (self.trace_dump_interval_ms > 0).then(|| Duration::from_millis(self.trace_dump_interval_ms))
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::ValidationError(format!("{} must be a whole number of milliseconds, got '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BridgeConfig::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.dispatch.retry_interval(), Duration::from_millis(100));
        assert_eq!(config.dispatch.ceiling(), Duration::from_secs(120));
        assert!(config.trace_dump_interval().is_none());
    }

    #[test]
    fn test_partial_dispatch_table() {
        let config = BridgeConfig::from_str(
            r#"
[dispatch]
ceiling_ms = 5000
"#,
        )
        .unwrap();
        assert_eq!(config.dispatch.ceiling_ms, 5000);
        assert_eq!(config.dispatch.retry_interval_ms, 100);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config
            .apply_env_from(|key| match key {
                ENV_TRACE_DUMP_MS => Some("250".to_string()),
                ENV_DISPATCH_RETRY_MS => Some(" 10 ".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.trace_dump_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.dispatch.retry_interval_ms, 10);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_env_from(|key| (key == ENV_DISPATCH_CEILING_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DISPATCH_CEILING_MS));
    }

    #[test]
    fn test_ceiling_shorter_than_retry_rejected() {
        let result = BridgeConfig::from_str(
            r#"
[dispatch]
retry_interval_ms = 500
ceiling_ms = 100
"#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
