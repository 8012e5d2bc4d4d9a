//! Database configuration module.

use std::{env, str::FromStr};

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,

    /// Maximum connection lifetime in seconds
    pub max_lifetime_secs: u64,
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T, String> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| format!("{var} has an invalid value: {value:?}")),
        Err(_) => Ok(default),
    }
}

impl DatabaseConfig {
    /// Pool defaults for `database_url`.
    ///
    /// The fleet holds few connections: each write is one short statement
    /// issued by a session pump.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is unset, meaning the fleet
    /// runs without persistence.
    ///
    /// Expected environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
    /// - `DB_MIN_CONNECTIONS`: Minimum pool size (default: 1)
    /// - `DB_CONNECTION_TIMEOUT`: Connection timeout in seconds (default: 10)
    /// - `DB_IDLE_TIMEOUT`: Idle timeout in seconds (default: 600)
    /// - `DB_MAX_LIFETIME`: Max lifetime in seconds (default: 1800)
    ///
    /// # Errors
    ///
    /// Returns the offending variable and value when a pool setting does not parse.
    pub fn from_env() -> Result<Option<Self>, String> {
        let Ok(database_url) = env::var("DATABASE_URL") else {
            return Ok(None);
        };
        let defaults = Self::new(database_url);
        Ok(Some(Self {
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            connection_timeout_secs: env_or(
                "DB_CONNECTION_TIMEOUT",
                defaults.connection_timeout_secs,
            )?,
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT", defaults.idle_timeout_secs)?,
            max_lifetime_secs: env_or("DB_MAX_LIFETIME", defaults.max_lifetime_secs)?,
            ..defaults
        }))
    }

    /// Create a default configuration for development
    ///
    /// Uses `postgres://postgres@localhost/fleet_db` as the database URL
    pub fn development() -> Self {
        Self::new("postgres://postgres@localhost/fleet_db")
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::development()
    }
}
