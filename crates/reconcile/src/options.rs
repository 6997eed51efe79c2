//! Controller options: YAML file, then `APPDECK_*` environment, then explicit overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(30);

pub const ENV_MAX_CONCURRENT: &str = "APPDECK_MAX_CONCURRENT";
pub const ENV_WAIT_TIME: &str = "APPDECK_WAIT_TIME";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("maxConcurrent must be greater than zero")]
    ZeroConcurrency,
    #[error("waitTime must be greater than zero")]
    ZeroWaitTime,
    #[error("{key}: invalid value {value:?}: {reason}")]
    InvalidEnv { key: &'static str, value: String, reason: String },
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse options: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Release controller tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReleaseControllerOptions {
    /// Upper bound on concurrently running reconciliations.
    pub max_concurrent: usize,
    /// Interval between status polls of one release.
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
}

impl Default for ReleaseControllerOptions {
    fn default() -> Self { Self { max_concurrent: DEFAULT_MAX_CONCURRENT, wait_time: DEFAULT_WAIT_TIME } }
}

impl ReleaseControllerOptions {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let opts = Self::from_yaml_str(&text)?;
        debug!(path = %path.display(), max_concurrent = opts.max_concurrent, wait_time = ?opts.wait_time, "options: loaded");
        Ok(opts)
    }

    /// Override from process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> { self.apply_env_from(|k| std::env::var(k).ok()) }

    /// Override from an arbitrary lookup. `APPDECK_WAIT_TIME` takes a humantime duration
    /// (`45s`, `2m`) or bare seconds.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_CONCURRENT).filter(|v| !v.trim().is_empty()) {
            self.max_concurrent = v.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
                key: ENV_MAX_CONCURRENT,
                value: v.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(v) = lookup(ENV_WAIT_TIME).filter(|v| !v.trim().is_empty()) {
            self.wait_time = parse_wait(v.trim())
                .map_err(|reason| ConfigError::InvalidEnv { key: ENV_WAIT_TIME, value: v.clone(), reason })?;
        }
        Ok(())
    }

    /// Every problem, not just the first.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();
        if self.max_concurrent == 0 {
            errs.push(ConfigError::ZeroConcurrency);
        }
        if self.wait_time.is_zero() {
            errs.push(ConfigError::ZeroWaitTime);
        }
        errs
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_wait_time(mut self, d: Duration) -> Self {
        self.wait_time = d;
        self
    }
}

pub fn parse_wait(s: &str) -> Result<Duration, String> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
