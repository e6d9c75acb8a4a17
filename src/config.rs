//! Defaults for a submission, read from the environment.
//!
//! Command line flags always win; these only replace the built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::runs::scheduler::{DEFAULT_POLL_INTERVAL, DEFAULT_PROGRESS_INTERVAL, DEFAULT_THROTTLE};

/// Errors that can occur while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Folder name under the user's home used when `TESTRUN_HOME` is unset.
pub const DEFAULT_HOME_FOLDER: &str = ".galasa";

/// Fallback requestor when the user name cannot be found.
pub const DEFAULT_REQUESTOR: &str = "cli";

/// Settings the command line falls back to.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitDefaults {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub throttle: i64,
    /// Framework home folder: boot jar, bootstrap, overrides, and local RAS.
    pub home: PathBuf,
}

impl Default for SubmitDefaults {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            throttle: DEFAULT_THROTTLE,
            home: default_home(|key| std::env::var(key).ok()),
        }
    }
}

impl SubmitDefaults {
    /// Reads the defaults from the process environment.
    ///
    /// - `TESTRUN_POLL_SECS`: seconds between polls (default: 30)
    /// - `TESTRUN_PROGRESS_MINS`: minutes between progress reports, 0 disables (default: 5)
    /// - `TESTRUN_THROTTLE`: runs in flight, 0 or less for no limit (default: 3)
    /// - `TESTRUN_HOME`: framework home folder (default: `~/.galasa`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// As [`from_env`](Self::from_env) with an injected variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            home: default_home(&lookup),
            ..Self::default()
        };

        if let Some(val) = lookup("TESTRUN_POLL_SECS") {
            let secs: u64 = parse_env_value(&val, "TESTRUN_POLL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("TESTRUN_PROGRESS_MINS") {
            let mins: u64 = parse_env_value(&val, "TESTRUN_PROGRESS_MINS")?;
            config.progress_interval = Duration::from_secs(mins.saturating_mul(60));
        }

        if let Some(val) = lookup("TESTRUN_THROTTLE") {
            config.throttle = parse_env_value(&val, "TESTRUN_THROTTLE")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll interval must be at least one second".to_string(),
            ));
        }
        if self.home.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "home folder must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_home<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(home) = lookup("TESTRUN_HOME").filter(|h| !h.is_empty()) {
        return PathBuf::from(home);
    }
    lookup("HOME")
        .or_else(|| lookup("USERPROFILE"))
        .map(|h| PathBuf::from(h).join(DEFAULT_HOME_FOLDER))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME_FOLDER))
}

/// Name recorded as the requestor of each run.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REQUESTOR.to_string())
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
