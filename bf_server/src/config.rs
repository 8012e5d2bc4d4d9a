//! Daemon configuration management.
//!
//! Consolidates all environment variable reads and command-line overrides
//! and provides validated configuration.

use bot_fleet::{
    Account, AccountId, AccountKind, ConnectionSettings, ScriptEntry, ServerTarget,
    SupervisorConfig, db::DatabaseConfig,
};
use std::{collections::HashSet, str::FromStr, time::Duration};

/// Complete daemon configuration
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Game server to connect to; `None` with `--loopback`
    pub server: Option<ServerTarget>,
    /// Accounts to keep connected
    pub accounts: Vec<Account>,
    /// Persistence; in-memory when `None`
    pub database: Option<DatabaseConfig>,
    /// Supervisor timings
    pub supervisor: SupervisorConfig,
    /// Behavior applied to every account
    pub settings: ConnectionSettings,
    /// Run against an in-process loopback server
    pub loopback: bool,
}

/// Values given on the command line, taking precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<ServerTarget>,
    pub accounts: Option<String>,
    pub database_url: Option<String>,
    pub loopback: bool,
}

impl FleetConfig {
    /// Load configuration from environment variables
    ///
    /// # Arguments
    ///
    /// * `overrides` - Values from CLI args
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to a value that does not parse
    pub fn from_env(overrides: Overrides) -> Result<Self, ConfigError> {
        let server = match overrides.server {
            Some(server) => Some(server),
            None => std::env::var("BOT_SERVER")
                .ok()
                .map(|value| {
                    value.parse().map_err(|reason| ConfigError::Invalid {
                        var: "BOT_SERVER".to_string(),
                        reason,
                    })
                })
                .transpose()?,
        };

        let kind: AccountKind = parse_env_or("BOT_ACCOUNT_KIND", AccountKind::Offline)?;
        let accounts = overrides
            .accounts
            .or_else(|| std::env::var("BOT_ACCOUNTS").ok())
            .map(|list| parse_accounts(&list, kind))
            .unwrap_or_default();

        let database = match overrides.database_url {
            Some(url) => Some(DatabaseConfig::new(url)),
            None => DatabaseConfig::from_env().map_err(|reason| ConfigError::Invalid {
                var: "DB_*".to_string(),
                reason,
            })?,
        };

        let defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            connect_timeout: Duration::from_secs(parse_env_or(
                "CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            stop_grace: Duration::from_secs(parse_env_or(
                "STOP_GRACE_SECS",
                defaults.stop_grace.as_secs(),
            )?),
            ..defaults
        };

        let login_messages = std::env::var("LOGIN_MESSAGES")
            .map(|value| parse_script(&value))
            .unwrap_or_default();
        let world_change_messages = std::env::var("WORLD_CHANGE_MESSAGES")
            .map(|value| parse_script(&value))
            .unwrap_or_default();
        let settings = ConnectionSettings {
            anti_afk_enabled: parse_env_or("ANTI_AFK_ENABLED", true)?,
            auto_reconnect_enabled: parse_env_or("AUTO_RECONNECT_ENABLED", true)?,
            login_delay: Duration::from_secs(parse_env_or(
                "LOGIN_DELAY_SECS",
                ConnectionSettings::default().login_delay.as_secs(),
            )?),
            login_messages_enabled: !login_messages.is_empty(),
            login_messages,
            world_change_messages_enabled: !world_change_messages.is_empty(),
            world_change_messages,
            offline_accounts_enabled: parse_env_or("OFFLINE_ACCOUNTS_ENABLED", true)?,
        };

        Ok(FleetConfig {
            server,
            accounts,
            database,
            supervisor,
            settings,
            loopback: overrides.loopback,
        })
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_none() && !self.loopback {
            return Err(ConfigError::MissingRequired {
                var: "BOT_SERVER".to_string(),
                hint: "Set host[:port] or pass --loopback for a dry run".to_string(),
            });
        }

        if self.accounts.is_empty() {
            return Err(ConfigError::MissingRequired {
                var: "BOT_ACCOUNTS".to_string(),
                hint: "Comma-separated id=name pairs, e.g. acct1=Steve,acct2=alex@example.com"
                    .to_string(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self.accounts.iter().find(|a| !seen.insert(&a.id)) {
            return Err(ConfigError::Invalid {
                var: "BOT_ACCOUNTS".to_string(),
                reason: format!("Account {} is listed twice", duplicate.id),
            });
        }

        if self.supervisor.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "CONNECT_TIMEOUT_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.supervisor.stop_grace.is_zero() {
            return Err(ConfigError::Invalid {
                var: "STOP_GRACE_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if let Some(database) = &self.database {
            if database.min_connections > database.max_connections {
                return Err(ConfigError::Invalid {
                    var: "DB_MIN_CONNECTIONS".to_string(),
                    reason: format!(
                        "Cannot exceed DB_MAX_CONNECTIONS ({})",
                        database.max_connections
                    ),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}\nHint: {hint}")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var: key.to_string(),
            reason: format!("Cannot parse {value:?}"),
        }),
        Err(_) => Ok(default),
    }
}

/// `acct1=Steve,acct2=alex@example.com`. A bare name is also its own id.
/// Names containing `@` are emails, anything else a nickname.
fn parse_accounts(list: &str, kind: AccountKind) -> Vec<Account> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, name) = entry.split_once('=').unwrap_or((entry, entry));
            let name = name.trim();
            let (nickname, email) = if name.contains('@') {
                (None, Some(name.to_string()))
            } else {
                (Some(name.to_string()), None)
            };
            Account {
                id: AccountId::new(id.trim()),
                kind,
                nickname,
                email,
            }
        })
        .collect()
}

/// `/login pw;hello all@5`. Entries are `;`-separated; a trailing `@<secs>`
/// sets that entry's delay.
fn parse_script(value: &str) -> Vec<ScriptEntry> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.rsplit_once('@') {
            Some((text, secs)) if !text.is_empty() => match secs.parse::<u64>() {
                Ok(secs) => ScriptEntry::new(text.trim()).with_delay(Duration::from_secs(secs)),
                Err(_) => ScriptEntry::new(entry),
            },
            _ => ScriptEntry::new(entry),
        })
        .collect()
}
