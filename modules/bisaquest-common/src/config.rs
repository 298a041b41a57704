use std::env;
use std::str::FromStr;

use crate::error::{BisaQuestError, Result};
use crate::types::DEFAULT_ROUND_SIZE;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,
    pub database_max_connections: u32,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Gameplay
    pub round_size: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup. Missing required keys and
    /// unparseable values are `Config` errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| BisaQuestError::Config("DATABASE_URL is required".into()))?;

        let round_size = parsed(&lookup, "ROUND_SIZE", DEFAULT_ROUND_SIZE)?;
        if round_size == 0 {
            return Err(BisaQuestError::Config("ROUND_SIZE must be at least 1".into()));
        }

        Ok(Self {
            database_url,
            database_max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            web_host: lookup("WEB_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            web_port: parsed(&lookup, "WEB_PORT", 3000)?,
            round_size,
        })
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BisaQuestError::Config(format!("{key} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}
