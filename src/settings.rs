//! Runtime settings from the environment, and logging setup for binaries.

use crate::error::ConfigError;
use crate::query::{RepositoryOptions, DEFAULT_LIMIT, MAX_LIMIT};
use std::str::FromStr;

pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// `DATABASE_URL`; the scheme picks the dialect.
    pub database_url: String,
    /// `ENTITY_ENGINE_MAX_CONNECTIONS`
    pub max_connections: u32,
    /// `ENTITY_ENGINE_DEFAULT_LIMIT`
    pub default_limit: u32,
    /// `ENTITY_ENGINE_MAX_LIMIT`
    pub max_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
        }
    }
}

impl Settings {
    /// Read settings from the process environment after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let settings = Settings {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse(&lookup, "ENTITY_ENGINE_MAX_CONNECTIONS", defaults.max_connections)?,
            default_limit: parse(&lookup, "ENTITY_ENGINE_DEFAULT_LIMIT", defaults.default_limit)?,
            max_limit: parse(&lookup, "ENTITY_ENGINE_MAX_LIMIT", defaults.max_limit)?,
        };
        if settings.default_limit > settings.max_limit {
            return Err(ConfigError::Env {
                key: "ENTITY_ENGINE_DEFAULT_LIMIT".into(),
                message: format!("exceeds ENTITY_ENGINE_MAX_LIMIT ({})", settings.max_limit),
            });
        }
        Ok(settings)
    }

    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            default_limit: self.default_limit,
            max_limit: self.max_limit,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, falling back to `default_filter`.
pub fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // a second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
