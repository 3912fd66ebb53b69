//! Configuration for the retrieval core
//!
//! Every section has working defaults. Values can come from a TOML or YAML
//! file (chosen by extension) and are then overridden by `PROTOCOL_GUARD_*`
//! environment variables.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::coordinator::RetrievalConfig;
use crate::error::ConfigError;
use crate::health::HealthThresholds;

/// Prefix shared by all environment overrides
pub const ENV_PREFIX: &str = "PROTOCOL_GUARD_";

/// Retrieval core settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub retrieval: RetrievalConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub health: HealthThresholds,
}

impl CoreConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `PROTOCOL_GUARD_*` overrides in place
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        env_override("RETRY_ATTEMPTS", &mut self.retrieval.primary_max_attempts)?;
        env_override("RETRY_BASE_DELAY_MS", &mut self.retrieval.primary_base_delay_ms)?;
        env_override("RETRY_JITTER", &mut self.retrieval.jitter)?;
        env_override("BREAKER_THRESHOLD", &mut self.breaker.threshold)?;
        env_override("BREAKER_RESET_TIMEOUT_MS", &mut self.breaker.reset_timeout_ms)?;
        env_override("BREAKER_HALF_OPEN_REQUESTS", &mut self.breaker.half_open_requests)?;
        env_override("CACHE_TTL_SECS", &mut self.cache.ttl_secs)?;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retrieval.primary_max_attempts == 0 {
            return Err(invalid("retrieval.primary_max_attempts", "0"));
        }
        if self.breaker.threshold == 0 {
            return Err(invalid("breaker.threshold", "0"));
        }
        if self.breaker.half_open_requests == 0 {
            return Err(invalid("breaker.half_open_requests", "0"));
        }
        if self.breaker.success_threshold > self.breaker.half_open_requests {
            return Err(invalid(
                "breaker.success_threshold",
                &self.breaker.success_threshold.to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Deserialize a TOML, YAML or JSON file chosen by extension
pub fn load_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_str(&content, &extension)
}

/// Deserialize `content` in the given format
pub fn parse_str<T: DeserializeOwned>(content: &str, format: &str) -> Result<T, ConfigError> {
    match format {
        "toml" => Ok(toml::from_str(content)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(content)?),
        "json" => Ok(serde_json::from_str(content)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Overwrite `target` from `PROTOCOL_GUARD_<name>` when set
pub fn env_override<T: FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError> {
    let key = format!("{}{}", ENV_PREFIX, name);
    if let Ok(raw) = std::env::var(&key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.clone(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.primary_max_attempts, 3);
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.cache.ttl_secs, 3_600);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CoreConfig = parse_str(
            "[breaker]\nthreshold = 2\n\n[cache]\nttl_secs = 60\n",
            "toml",
        )
        .unwrap();
        assert_eq!(config.breaker.threshold, 2);
        assert_eq!(config.breaker.half_open_requests, 3);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.retrieval.database_key, "database");
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "retrieval:\n  primary_max_attempts: 5\n  jitter: true").unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retrieval.primary_max_attempts, 5);
        assert!(config.retrieval.jitter);
    }

    #[test]
    fn test_unknown_extension() {
        let result: Result<CoreConfig, _> = parse_str("", "ini");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = CoreConfig::default();
        config.breaker.threshold = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_env_override_parse_error() {
        std::env::set_var("PROTOCOL_GUARD_TEST_ONLY_VALUE", "many");
        let mut value = 3u32;
        let result = env_override("TEST_ONLY_VALUE", &mut value);
        assert!(result.is_err());
        assert_eq!(value, 3);
        std::env::remove_var("PROTOCOL_GUARD_TEST_ONLY_VALUE");
    }
}
