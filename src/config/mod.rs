//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup and fails fast on malformed values. Environment
//! variables override file settings.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub log_level: String,
    pub otel_endpoint: Option<String>,
    /// Wait per lock attempt before logging and retrying.
    pub lock_timeout: Duration,
    /// Default deferral sleep time.
    pub sleep_time: Duration,
    /// Worker loops in the in-process pool.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
            lock_timeout: Duration::from_millis(2000),
            sleep_time: Duration::from_millis(1000),
            workers: 4,
        }
    }
}

/// File layout; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    log_level: Option<String>,
    otel_endpoint: Option<String>,
    lock_timeout_ms: Option<u64>,
    sleep_ms: Option<u64>,
    workers: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let base = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))?;
        base.overlay(|name| std::env::var(name).ok())
    }

    /// Parse TOML settings over the defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Self::default();
        let config = Self {
            log_level: file.log_level.unwrap_or(defaults.log_level),
            otel_endpoint: file.otel_endpoint.or(defaults.otel_endpoint),
            lock_timeout: file
                .lock_timeout_ms
                .map_or(defaults.lock_timeout, Duration::from_millis),
            sleep_time: file
                .sleep_ms
                .map_or(defaults.sleep_time, Duration::from_millis),
            workers: file.workers.unwrap_or(defaults.workers),
        };
        config.validate()
    }

    /// Build from an arbitrary variable source over the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Self::default().overlay(lookup)
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(level) = lookup("DEFERQ_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(endpoint) = lookup("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Some(ms) = parse_var(&lookup, "DEFERQ_LOCK_TIMEOUT_MS")? {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "DEFERQ_SLEEP_MS")? {
            self.sleep_time = Duration::from_millis(ms);
        }
        if let Some(workers) = parse_var(&lookup, "DEFERQ_WORKERS")? {
            self.workers = workers;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.log_level.trim().is_empty() {
            return Err(Error::Config("log level is empty".to_string()));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::Config("lock timeout must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw:?}"))),
        None => Ok(None),
    }
}
