use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use thiserror::Error;

use crate::generic::{DEFAULT_MAX_EVENTS, DEFAULT_NAME};

/// Poller backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backend {
    /// Platform default: epoll on Linux, kqueue on BSD/macOS, poll elsewhere.
    #[default]
    Auto,
    Epoll,
    Kqueue,
    Poll,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "epoll" => Ok(Backend::Epoll),
            "kqueue" => Ok(Backend::Kqueue),
            "poll" => Ok(Backend::Poll),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Auto => "auto",
            Backend::Epoll => "epoll",
            Backend::Kqueue => "kqueue",
            Backend::Poll => "poll",
        };
        f.write_str(s)
    }
}

/// Looper runtime configuration (simple key=value format).
#[derive(Debug, Clone, PartialEq)]
pub struct LooperConfig {
    pub name: String,
    pub backend: Backend,
    /// Size of the event buffer handed to the poller on each wait.
    pub max_events: usize,
    pub log_level: LevelFilter,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),

    #[error("malformed config line: {0:?}")]
    InvalidFormat(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl Default for LooperConfig {
    fn default() -> Self {
        LooperConfig {
            name: DEFAULT_NAME.to_string(),
            backend: Backend::Auto,
            max_events: DEFAULT_MAX_EVENTS,
            log_level: LevelFilter::Info,
        }
    }
}

impl LooperConfig {
    /// Load configuration from a key=value file on top of the defaults.
    /// Example:
    /// name=Generic
    /// backend=poll
    /// max_events=256
    /// log_level=debug
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut cfg = LooperConfig::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, val) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidFormat(line.to_string()))?;
            let key = key.trim();
            if !cfg.set(key, val.trim())? {
                return Err(ConfigError::InvalidFormat(line.to_string()));
            }
        }
        Ok(cfg)
    }

    /// Defaults, then the file named by `LOOPER_CONFIG`, then the
    /// `LOOPER_NAME`, `LOOPER_BACKEND`, `LOOPER_MAX_EVENTS` and `LOOPER_LOG`
    /// variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match env::var_os("LOOPER_CONFIG") {
            Some(path) => Self::load_from_file(path)?,
            None => LooperConfig::default(),
        };
        let vars = [
            ("LOOPER_NAME", "name"),
            ("LOOPER_BACKEND", "backend"),
            ("LOOPER_MAX_EVENTS", "max_events"),
            ("LOOPER_LOG", "log_level"),
        ];
        for (var, key) in vars {
            if let Ok(val) = env::var(var) {
                cfg.set(key, val.trim())?;
            }
        }
        Ok(cfg)
    }

    /// Applies one setting. Returns `Ok(false)` for an unknown key.
    fn set(&mut self, key: &str, val: &str) -> Result<bool, ConfigError> {
        let invalid = || ConfigError::InvalidValue { key: key.to_string(), value: val.to_string() };
        match key {
            "name" => {
                if val.is_empty() {
                    return Err(invalid());
                }
                self.name = val.to_string();
            }
            "backend" => self.backend = val.parse().map_err(|_| invalid())?,
            "max_events" => {
                self.max_events = match val.parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(invalid()),
                }
            }
            "log_level" => self.log_level = val.parse().map_err(|_| invalid())?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}
