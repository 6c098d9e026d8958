//! Connection settings, read from the `database` section of the same YAML
//! document as [`DataConfig`](keel_data::DataConfig).
//!
//! ```yaml
//! database:
//!   url: "sqlite://app.db?mode=rwc"
//!   max_connections: 5
//! ```

use keel_data::config::read_optional;
use keel_data::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Default, Deserialize)]
struct Root {
    #[serde(default)]
    database: SqliteConfig,
}

impl SqliteConfig {
    /// `true` for URLs that open an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let root: Root =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))?;
        root.database.validate()?;
        Ok(root.database)
    }

    /// Read a YAML file. A missing file yields the defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match read_optional(path.as_ref())? {
            Some(content) => Self::from_yaml_str(&content),
            None => Ok(Self::default()),
        }
    }

    /// File, then `.env`, then `KEEL_DATABASE_URL` and
    /// `KEEL_DATABASE_MAX_CONNECTIONS`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_yaml_file(path)?;
        let _ = dotenvy::dotenv();
        if let Ok(url) = std::env::var("KEEL_DATABASE_URL") {
            config.url = url;
        }
        if let Ok(raw) = std::env::var("KEEL_DATABASE_MAX_CONNECTIONS") {
            config.max_connections = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "KEEL_DATABASE_MAX_CONNECTIONS".to_string(),
                message: format!("{e}"),
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "database.url".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "database.max_connections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
