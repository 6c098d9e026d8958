//! Data-layer configuration.
//!
//! Resolution order (lowest to highest priority):
//! 1. built-in defaults
//! 2. a YAML document (string or file, a missing file counts as empty)
//! 3. `.env` file (loaded into the process environment, never overwriting)
//! 4. `KEEL_*` environment variables
//!
//! ```yaml
//! cache:
//!   enabled: true
//!   key_prefix: "app:"
//!   default_ttl_secs: 300
//! paging:
//!   default_page_size: 20
//!   max_page_size: 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O or YAML parsing error occurred while loading config.
    Load(String),
    /// A value was read but is not acceptable.
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Load(msg) => write!(f, "Config load error: {msg}"),
            ConfigError::Invalid { key, message } => {
                write!(f, "Invalid config value for '{key}': {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub key_prefix: String,
    pub default_ttl_secs: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: String::new(),
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub cache: CacheConfig,
    pub paging: PagingConfig,
}

impl DataConfig {
    /// Parse a YAML document. Unknown sections are ignored so the same file
    /// can carry backend settings.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file. A missing file yields the defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match read_optional(path.as_ref())? {
            Some(content) => Self::from_yaml_str(&content),
            None => Ok(Self::default()),
        }
    }

    /// Full resolution: file, then `.env`, then `KEEL_*` variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_yaml_file(path)?;
        let _ = dotenvy::dotenv();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Overlay `KEEL_*` key/value pairs. Other keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "KEEL_CACHE_ENABLED" => self.cache.enabled = parse(key, value)?,
                "KEEL_CACHE_KEY_PREFIX" => self.cache.key_prefix = value.to_string(),
                "KEEL_CACHE_DEFAULT_TTL_SECS" => self.cache.default_ttl_secs = parse(key, value)?,
                "KEEL_PAGING_DEFAULT_PAGE_SIZE" => {
                    self.paging.default_page_size = parse(key, value)?
                }
                "KEEL_PAGING_MAX_PAGE_SIZE" => self.paging.max_page_size = parse(key, value)?,
                _ => continue,
            }
            tracing::debug!(key, "config override from environment");
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paging.default_page_size == 0 {
            return Err(ConfigError::invalid(
                "paging.default_page_size",
                "must be at least 1",
            ));
        }
        if self.paging.max_page_size < self.paging.default_page_size {
            return Err(ConfigError::invalid(
                "paging.max_page_size",
                "must not be smaller than paging.default_page_size",
            ));
        }
        Ok(())
    }
}

/// Read a config file, treating a missing file as absent.
pub fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(path)
        .map(Some)
        .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))
}

fn parse<V: std::str::FromStr>(key: &str, value: &str) -> Result<V, ConfigError>
where
    V::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: V::Err| ConfigError::invalid(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DataConfig::default();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.paging.default_page_size, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = DataConfig::from_yaml_str(
            "cache:\n  key_prefix: \"app:\"\ndatabase:\n  url: sqlite::memory:\n",
        )
        .unwrap();
        assert_eq!(config.cache.key_prefix, "app:");
        assert!(config.cache.enabled);
        assert_eq!(config.paging, PagingConfig::default());
    }

    #[test]
    fn test_malformed_yaml_is_load_error() {
        let err = DataConfig::from_yaml_str("cache: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_overrides() {
        let mut config = DataConfig::default();
        config
            .apply_overrides([
                ("KEEL_CACHE_ENABLED", "false"),
                ("KEEL_PAGING_MAX_PAGE_SIZE", "50"),
                ("UNRELATED", "x"),
            ])
            .unwrap();
        assert!(!config.cache.enabled);
        assert_eq!(config.paging.max_page_size, 50);
    }

    #[test]
    fn test_bad_override_is_invalid() {
        let mut config = DataConfig::default();
        let err = config
            .apply_overrides([("KEEL_CACHE_DEFAULT_TTL_SECS", "soon")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "KEEL_CACHE_DEFAULT_TTL_SECS"));
    }

    #[test]
    fn test_max_below_default_is_rejected() {
        let err = DataConfig::from_yaml_str("paging:\n  default_page_size: 50\n  max_page_size: 10\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
