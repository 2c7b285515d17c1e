use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::retry::RetryPolicy;
use crate::util::expand_tilde;
use crate::{hlog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    crate::orchestration::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_team")]
    pub team: String,
    pub state_dir: Option<String>,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_team() -> String {
    "default".to_string()
}

fn default_idle_poll_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            team: default_team(),
            state_dir: None,
            idle_poll_ms: default_idle_poll_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    /// Directory holding the task table and message log.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::hive_dir(),
        }
    }

    pub fn tasks_path(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("tasks.json"))
    }

    pub fn messages_path(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("messages.jsonl"))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        if config.retry.multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "retry.multiplier must be >= 1.0, got {}",
                config.retry.multiplier
            )));
        }
        hlog_debug!(
            "Config loaded: team={}, state_dir={:?}, retry.max_attempts={}",
            config.team,
            config.state_dir,
            config.retry.max_attempts
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                hlog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        hlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let state_dir = self.state_dir()?;
        if !state_dir.exists() {
            hlog_debug!("Creating state directory: {}", state_dir.display());
            fs::create_dir_all(&state_dir)?;
        }
        Ok(())
    }
}
