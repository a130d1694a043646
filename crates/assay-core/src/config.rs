use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};
use crate::sqlite::DEFAULT_RETRY_ATTEMPTS;

pub const HOME_ENV: &str = "ASSAY_HOME";
pub const DATABASE_ENV: &str = "ASSAY_DB";
pub const CONFIG_FILE_NAME: &str = "assay.yaml";
pub const DATABASE_FILE_NAME: &str = "registry.sqlite3";
pub const DEFAULT_HOME: &str = ".assay";
pub const DEFAULT_TAIL_BYTES: usize = 4096;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 6 * 60 * 60;

pub type ConfigResult<T> = Result<T, CoreError>;

/// Per-skill overrides. Only knobs of a built-in skill can be changed here.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkillConfig {
    pub executable: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssayConfig {
    pub database: Option<PathBuf>,
    pub pipelines_dir: Option<PathBuf>,
    pub pipelines: Vec<PathBuf>,
    /// Replaces the built-in timeout of every skill without its own override.
    pub default_timeout_secs: Option<u64>,
    pub stale_after_secs: u64,
    pub store_retry_attempts: u32,
    pub tail_bytes: usize,
    pub skills: BTreeMap<String, SkillConfig>,
    #[serde(skip)]
    pub home: PathBuf,
}

impl Default for AssayConfig {
    fn default() -> Self {
        Self {
            database: None,
            pipelines_dir: None,
            pipelines: Vec::new(),
            default_timeout_secs: None,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            store_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            tail_bytes: DEFAULT_TAIL_BYTES,
            skills: BTreeMap::new(),
            home: PathBuf::from(DEFAULT_HOME),
        }
    }
}

impl AssayConfig {
    /// Loads `$ASSAY_HOME/assay.yaml` (or `./.assay/assay.yaml`). A missing file
    /// yields the defaults; `ASSAY_DB` wins over the file's `database`.
    pub fn load() -> ConfigResult<Self> {
        let home = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
        let mut config = Self::load_from(&home)?;
        if let Some(database) = std::env::var_os(DATABASE_ENV).filter(|value| !value.is_empty()) {
            config.database = Some(PathBuf::from(database));
        }
        Ok(config)
    }

    pub fn load_from(home: &Path) -> ConfigResult<Self> {
        let path = home.join(CONFIG_FILE_NAME);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Self::default(),
            Ok(raw) => Self::parse(&raw).map_err(|error| CoreError {
                message: format!("{}: {}", path.display(), error.message),
                ..error
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(error) => {
                return Err(config_error(format!(
                    "failed to read '{}': {error}",
                    path.display()
                )));
            }
        };
        config.home = home.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> ConfigResult<Self> {
        serde_yaml::from_str(raw).map_err(|error| config_error(format!("invalid config: {error}")))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(unknown) = self
            .skills
            .keys()
            .find(|name| crate::skills::descriptor(name).is_none())
        {
            return Err(config_error(format!(
                "config overrides unknown skill '{unknown}'; only built-in skills can be configured"
            )));
        }
        if self.default_timeout_secs == Some(0)
            || self.skills.values().any(|skill| skill.timeout_secs == Some(0))
        {
            return Err(config_error("timeouts must be greater than zero"));
        }
        if self.store_retry_attempts == 0 {
            return Err(config_error("store_retry_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.home.join(DATABASE_FILE_NAME))
    }

    pub fn pipelines_dir(&self) -> PathBuf {
        self.pipelines_dir
            .clone()
            .unwrap_or_else(|| self.home.join("pipelines"))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE_NAME)
    }

    /// Writes this config to `config_path()` unless a file is already there.
    /// Returns whether a file was written.
    pub fn write_if_missing(&self) -> ConfigResult<bool> {
        let path = self.config_path();
        if path.exists() {
            return Ok(false);
        }
        let raw = serde_yaml::to_string(self)
            .map_err(|error| config_error(format!("failed to render config: {error}")))?;
        crate::export::atomic_write_bytes(&path, raw.as_bytes()).map_err(|error| {
            config_error(format!("failed to write '{}': {error}", path.display()))
        })?;
        Ok(true)
    }
}

fn config_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::ConfigError, message)
}
