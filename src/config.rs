use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::agent::ExecutorConfig;
use crate::resilience::{BreakerConfig, PoolConfig, RetryPolicy};
use crate::workflow::EngineConfig;
use crate::{Error, Result};

/// Top-level configuration, one section per component.
///
/// Every section is optional in the file; missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Where the text-generation service lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the bearer token, if any.
    pub api_key_env: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/v1/generate".to_string(),
            model: "default".to_string(),
            api_key_env: Some("CONDUCTOR_API_KEY".to_string()),
        }
    }
}

impl ServiceConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Directory for file checkpoints, honouring `engine.checkpoint_dir`.
    pub fn checkpoint_dir(&self) -> Result<PathBuf> {
        match &self.engine.checkpoint_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("checkpoints")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            endpoint = %config.service.endpoint,
            max_concurrency = config.engine.max_concurrency,
            fail_fast = config.engine.fail_fast,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Serde adapter writing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.pool.max_per_endpoint, 4);
        assert_eq!(config.executor.reserved_completion_tokens, 1024);
        assert_eq!(config.engine.max_concurrency, 4);
        assert!(config.engine.fail_fast);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/foo/bar");
        assert!(expanded.ends_with("foo/bar"));
        assert!(!expanded.to_string_lossy().contains('~'));

        let absolute = expand_tilde("/absolute/path");
        assert_eq!(absolute, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [breaker]
            failure_threshold = 3
            open_timeout_ms = 1000

            [engine]
            max_concurrency = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.open_timeout, Duration::from_secs(1));
        assert_eq!(config.breaker.half_open_required_successes, 2);
        assert_eq!(config.engine.max_concurrency, 2);
        assert!(config.engine.fail_fast);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.retry.max_attempts = 7;
        config.engine.checkpoint_dir = Some("~/runs".to_string());
        config.service.endpoint = "https://gen.example.com/v1".to_string();

        let toml = toml::to_string(&config).unwrap();
        assert!(toml.contains("initial_delay_ms = 500"));
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
        assert!(parsed.checkpoint_dir().unwrap().ends_with("runs"));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/conductor.toml");

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let mut config = Config::default();
        config.engine.fail_fast = false;
        config.pool.max_per_endpoint = 8;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_api_key_from_env() {
        let service = ServiceConfig {
            api_key_env: Some("CONDUCTOR_TEST_KEY_UNSET_XYZ".to_string()),
            ..ServiceConfig::default()
        };
        assert!(service.api_key().is_none());

        let none = ServiceConfig {
            api_key_env: None,
            ..ServiceConfig::default()
        };
        assert!(none.api_key().is_none());
    }
}
