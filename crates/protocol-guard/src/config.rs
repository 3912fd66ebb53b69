//! Aggregate configuration
//!
//! ```toml
//! [retrieval]
//! primary_max_attempts = 3
//! primary_base_delay_ms = 500
//!
//! [breaker]
//! threshold = 5
//!
//! [monitor]
//! success_target = 99.0
//!
//! [paths]
//! local_index = "data/protocols.json"
//! formulary = "data/formulary.yaml"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use protocol_guard_core::config::{load_file, ENV_PREFIX};
use protocol_guard_core::CoreConfig;

use crate::error::Result;
use crate::formulary::Formulary;
use crate::monitor::MonitorConfig;
use crate::vocabulary::Vocabulary;

/// Locations of the data files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Vocabulary override; built-in tables when unset
    pub vocabulary: Option<PathBuf>,
    /// Formulary override; built-in table when unset
    pub formulary: Option<PathBuf>,
    /// Records served by the local index tier
    pub local_index: Option<PathBuf>,
    /// JSON lines file receiving audit records
    pub audit_log: Option<PathBuf>,
}

impl PathsConfig {
    fn apply_env(&mut self) {
        env_path("VOCABULARY", &mut self.vocabulary);
        env_path("FORMULARY", &mut self.formulary);
        env_path("LOCAL_INDEX", &mut self.local_index);
        env_path("AUDIT_LOG", &mut self.audit_log);
    }
}

fn env_path(name: &str, target: &mut Option<PathBuf>) {
    if let Ok(raw) = std::env::var(format!("{}{}", ENV_PREFIX, name)) {
        if !raw.trim().is_empty() {
            *target = Some(PathBuf::from(raw.trim()));
        }
    }
}

/// Everything the CLI and an embedding service need
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    #[serde(flatten)]
    pub core: CoreConfig,
    pub monitor: MonitorConfig,
    pub paths: PathsConfig,
}

impl GuardConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Read a TOML, YAML or JSON file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: GuardConfig = load_file(path)?;
        config.apply_env()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// From `path` when given, else defaults; environment overrides either way
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::from_env(),
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.core.apply_env()?;
        self.paths.apply_env();
        Ok(())
    }

    pub fn vocabulary(&self) -> Result<Vocabulary> {
        match &self.paths.vocabulary {
            Some(path) => Vocabulary::from_file(path),
            None => Ok(Vocabulary::default()),
        }
    }

    pub fn formulary(&self) -> Result<Formulary> {
        match &self.paths.formulary {
            Some(path) => Formulary::from_file(path),
            None => Ok(Formulary::default()),
        }
    }
}
