use serde::{Deserialize, Serialize};
use std::fmt;

use super::protocol_version::ProtocolVersion;

/// A packet sent by a bot to the game server.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ServerboundPacket {
    /// First packet on every connection. Opens the login phase.
    Handshake {
        version: ProtocolVersion,
        username: String,
        online_mode: bool,
    },
    /// Echo of a clientbound keepalive.
    KeepAlive { id: u64 },
    /// A chat line or a slash command.
    Chat { message: String },
    /// Absolute position update.
    PlayerPosition {
        x: f64,
        y: f64,
        z: f64,
        on_ground: bool,
    },
    /// Courtesy notice before closing the socket.
    Disconnect,
}

impl fmt::Display for ServerboundPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake {
                version, username, ..
            } => write!(f, "handshake from {username} ({version:?})"),
            Self::KeepAlive { id } => write!(f, "keepalive {id}"),
            Self::Chat { message } => write!(f, "chat '{message}'"),
            Self::PlayerPosition { x, y, z, .. } => write!(f, "position ({x:.2}, {y:.2}, {z:.2})"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Kinds of clientbound packets a listener can subscribe to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PacketKind {
    LoginSuccess,
    LoginRejected,
    JoinGame,
    Respawn,
    Chat,
    KeepAlive,
    Disconnect,
}

/// A packet sent by the game server to a bot.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ClientboundPacket {
    /// Login accepted; play phase follows.
    LoginSuccess { uuid: String, username: String },
    /// Login refused; the server closes the connection afterwards.
    LoginRejected { reason: String },
    /// The player entered the world.
    JoinGame { entity_id: i32, dimension: String },
    /// The player moved to another world or dimension.
    Respawn { dimension: String },
    /// Chat component, usually JSON.
    Chat { json: String },
    /// Liveness check that must be echoed with the same id.
    KeepAlive { id: u64 },
    /// The server is closing the connection.
    Disconnect { reason: String },
}

impl ClientboundPacket {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::LoginSuccess { .. } => PacketKind::LoginSuccess,
            Self::LoginRejected { .. } => PacketKind::LoginRejected,
            Self::JoinGame { .. } => PacketKind::JoinGame,
            Self::Respawn { .. } => PacketKind::Respawn,
            Self::Chat { .. } => PacketKind::Chat,
            Self::KeepAlive { .. } => PacketKind::KeepAlive,
            Self::Disconnect { .. } => PacketKind::Disconnect,
        }
    }
}

impl fmt::Display for ClientboundPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginSuccess { username, .. } => write!(f, "login success for {username}"),
            Self::LoginRejected { reason } => write!(f, "login rejected: {reason}"),
            Self::JoinGame { dimension, .. } => write!(f, "joined {dimension}"),
            Self::Respawn { dimension } => write!(f, "respawned in {dimension}"),
            Self::Chat { json } => write!(f, "chat {json}"),
            Self::KeepAlive { id } => write!(f, "keepalive {id}"),
            Self::Disconnect { reason } => write!(f, "disconnect: {reason}"),
        }
    }
}

/// Extract the plain text of a chat component.
///
/// Objects contribute their `text` plus the text of each `extra` child,
/// strings are used as-is and anything that isn't JSON passes through.
pub fn chat_text(json: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(json) {
        Ok(value @ serde_json::Value::Object(_)) => {
            let mut out = String::new();
            collect_text(&value, &mut out);
            out
        }
        Ok(serde_json::Value::String(text)) => text,
        _ => json.to_string(),
    }
}

fn collect_text(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(text) => out.push_str(text),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                out.push_str(text);
            }
            if let Some(serde_json::Value::Array(extra)) = map.get("extra") {
                for child in extra {
                    collect_text(child, out);
                }
            }
        }
        _ => {}
    }
}
