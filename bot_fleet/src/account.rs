//! Accounts, targets and per-session settings.
//!
//! Everything in here is captured once when a session starts and never
//! mutated afterwards. Changing settings means starting a new session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};
use uuid::Uuid;

/// Default port used when a target is given without one.
pub const DEFAULT_PORT: u16 = 25565;

/// Default delay before each script entry after the first.
pub const DEFAULT_SCRIPT_DELAY: Duration = Duration::from_secs(2);

/// Default settle delay before the first script entry.
pub const DEFAULT_LOGIN_DELAY: Duration = Duration::from_secs(3);

/// Name used when an account has neither a nickname nor an email.
const FALLBACK_USERNAME: &str = "Player";

/// Stable identifier of a bot account.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How an account authenticates against the game server.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Offline-mode ("cracked") account, no session server involved.
    #[default]
    #[serde(alias = "cracked")]
    Offline,
    /// Account backed by an online identity provider.
    #[serde(alias = "microsoft")]
    Authenticated,
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" | "cracked" => Ok(Self::Offline),
            "authenticated" | "microsoft" => Ok(Self::Authenticated),
            other => Err(format!("unknown account kind '{other}'")),
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            Self::Offline => "offline",
            Self::Authenticated => "authenticated",
        };
        write!(f, "{repr}")
    }
}

/// Identity used to join a server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub kind: AccountKind,
    pub nickname: Option<String>,
    pub email: Option<String>,
}

impl Account {
    /// Offline account joining under `nickname`.
    pub fn offline(id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            id: AccountId::new(id),
            kind: AccountKind::Offline,
            nickname: Some(nickname.into()),
            email: None,
        }
    }

    /// Name the bot presents in-game.
    ///
    /// Offline accounts prefer their nickname, authenticated accounts prefer
    /// the local part of their email. Empty values are skipped.
    pub fn username(&self) -> String {
        let nickname = self.nickname.as_deref().filter(|n| !n.is_empty());
        let email_name = self
            .email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|n| !n.is_empty());

        let chosen = match self.kind {
            AccountKind::Offline => nickname.or(email_name),
            AccountKind::Authenticated => email_name.or(nickname),
        };
        chosen.unwrap_or(FALLBACK_USERNAME).to_string()
    }

    pub fn online_mode(&self) -> bool {
        self.kind == AccountKind::Authenticated
    }
}

/// Host and port of a game server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
}

impl ServerTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve the target to socket addresses. Called once per attempt.
    pub fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl From<SocketAddr> for ServerTarget {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for ServerTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("server address is empty".to_string());
        }
        // IPv6 literals carry colons of their own: `[::1]:25565`, `[::1]` or `::1`.
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let unbracketed = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), DEFAULT_PORT));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                if host.contains([':', '[', ']']) {
                    return Err(format!("invalid host in '{s}'"));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in '{s}'"))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(format!("missing host in '{s}'")),
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One line of a chat script.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScriptEntry {
    pub text: String,
    /// Wait before sending this entry. Ignored for the first entry,
    /// which waits for the session's login delay instead.
    #[serde(default = "default_script_delay", with = "duration_secs")]
    pub delay: Duration,
}

impl ScriptEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay: DEFAULT_SCRIPT_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn default_script_delay() -> Duration {
    DEFAULT_SCRIPT_DELAY
}

fn default_login_delay() -> Duration {
    DEFAULT_LOGIN_DELAY
}

fn default_true() -> bool {
    true
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Behavior flags captured when a session starts.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub anti_afk_enabled: bool,
    #[serde(default)]
    pub auto_reconnect_enabled: bool,
    /// Settle delay before the first entry of either chat script.
    #[serde(default = "default_login_delay", with = "duration_secs")]
    pub login_delay: Duration,
    #[serde(default)]
    pub login_messages_enabled: bool,
    #[serde(default)]
    pub login_messages: Vec<ScriptEntry>,
    #[serde(default)]
    pub world_change_messages_enabled: bool,
    #[serde(default)]
    pub world_change_messages: Vec<ScriptEntry>,
    /// Whether offline accounts may be started at all.
    #[serde(default = "default_true")]
    pub offline_accounts_enabled: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            anti_afk_enabled: false,
            auto_reconnect_enabled: false,
            login_delay: DEFAULT_LOGIN_DELAY,
            login_messages_enabled: false,
            login_messages: Vec::new(),
            world_change_messages_enabled: false,
            world_change_messages: Vec::new(),
            offline_accounts_enabled: true,
        }
    }
}

impl ConnectionSettings {
    /// Login script to run on entering `Active`, if any.
    pub fn login_script(&self) -> Option<&[ScriptEntry]> {
        (self.login_messages_enabled && !self.login_messages.is_empty())
            .then_some(self.login_messages.as_slice())
    }

    /// Script to run after every world change, if any.
    pub fn world_change_script(&self) -> Option<&[ScriptEntry]> {
        (self.world_change_messages_enabled && !self.world_change_messages.is_empty())
            .then_some(self.world_change_messages.as_slice())
    }
}

/// Direction of a chat line relative to the bot.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ChatDirection {
    Inbound,
    Outbound,
}

/// A chat line on its way to persistence.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChatEvent {
    pub id: Uuid,
    pub account_id: AccountId,
    pub text: String,
    pub direction: ChatDirection,
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    pub fn new(account_id: AccountId, text: impl Into<String>, direction: ChatDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            text: text.into(),
            direction,
            timestamp: Utc::now(),
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == ChatDirection::Outbound
    }
}
