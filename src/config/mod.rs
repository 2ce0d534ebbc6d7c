//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::DEFAULT_NAME;
use secrecy::SecretString;

/// Default number of concurrent workers per fetcher.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default sleep after a poll finds an empty queue.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Queue namespace, the `{name}` in `{name}:tasks:{key}`.
    pub name: String,
    pub concurrency: usize,
    pub backoff: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let concurrency = match std::env::var("GAZER_CONCURRENCY") {
            Ok(raw) => parse_var("GAZER_CONCURRENCY", &raw)?,
            Err(_) => DEFAULT_CONCURRENCY,
        };
        if concurrency == 0 {
            return Err(Error::Config(
                "GAZER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let backoff = match std::env::var("GAZER_BACKOFF_MS") {
            Ok(raw) => Duration::from_millis(parse_var("GAZER_BACKOFF_MS", &raw)?),
            Err(_) => DEFAULT_BACKOFF,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            name: std::env::var("GAZER_NAME")
                .ok()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            concurrency,
            backoff,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_var<N: std::str::FromStr>(name: &str, raw: &str) -> Result<N> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw:?}")))
}
