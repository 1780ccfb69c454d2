// src/config.rs
use crate::error::{EtudeError, EtudeResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address (default: 127.0.0.1)
    pub host: String,

    /// Listen port (default: 8080, 0 picks an ephemeral port)
    pub port: u16,

    /// Directory files are served from (default: ./www)
    pub doc_root: PathBuf,

    /// Worker threads running connection tasks (default: one per CPU)
    pub workers: usize,

    /// Maximum simultaneously open connections (default: 65536)
    pub max_connections: usize,

    /// Seconds a parked connection may stay silent before it is closed
    /// (default: 30, 0 disables pruning)
    pub idle_timeout_secs: u64,

    /// Seconds between metrics reports (default: 0, disabled)
    pub metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./www"),
            workers: num_cpus::get(),
            max_connections: 65_536,
            idle_timeout_secs: 30,
            metrics_interval_secs: 0,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`, falling back to the defaults for
    /// missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EtudeResult<Self> {
        let defaults = Config::default();
        Ok(Config {
            host: lookup("ETUDE_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "ETUDE_PORT", defaults.port)?,
            doc_root: lookup("ETUDE_DOC_ROOT").map_or(defaults.doc_root, PathBuf::from),
            workers: parse_var(&lookup, "ETUDE_WORKERS", defaults.workers)?,
            max_connections: parse_var(&lookup, "ETUDE_MAX_CONNECTIONS", defaults.max_connections)?,
            idle_timeout_secs: parse_var(&lookup, "ETUDE_IDLE_TIMEOUT", defaults.idle_timeout_secs)?,
            metrics_interval_secs: parse_var(
                &lookup,
                "ETUDE_METRICS_INTERVAL",
                defaults.metrics_interval_secs,
            )?,
        })
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> EtudeResult<()> {
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".to_string()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0).then(|| Duration::from_secs(self.metrics_interval_secs))
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> EtudeResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EtudeError::Config(format!("{key}={raw:?}: {e}"))),
    }
}
