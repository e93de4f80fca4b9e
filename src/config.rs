//! Environment configuration

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Tunables for an [`Environment`](crate::Environment)
///
/// ```toml
/// modeset_allow = true
/// restore_on_close = true
/// commit_retry_limit = 3
/// commit_retry_delay_ms = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Queue commits with ALLOW_MODESET
    pub modeset_allow: bool,
    /// Commit the state found at open when the environment is dropped
    pub restore_on_close: bool,
    /// How many times a queued commit rejected with EBUSY is retried
    pub commit_retry_limit: u32,
    pub commit_retry_delay_ms: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            modeset_allow: false,
            restore_on_close: true,
            commit_retry_limit: 3,
            commit_retry_delay_ms: 2,
        }
    }
}

impl EnvConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::InvalidValue(format!("config: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.commit_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let c = EnvConfig::from_toml_str("modeset_allow = true\ncommit_retry_limit = 0\n").unwrap();
        assert!(c.modeset_allow);
        assert_eq!(c.commit_retry_limit, 0);
        assert!(c.restore_on_close);
        assert_eq!(c.retry_delay(), Duration::from_millis(2));
    }

    #[test]
    fn test_bad_config() {
        assert!(matches!(
            EnvConfig::from_toml_str("modeset_allow = 3"),
            Err(Error::InvalidValue(_))
        ));
        assert_eq!(EnvConfig::from_toml_str("").unwrap(), EnvConfig::default());
    }
}
