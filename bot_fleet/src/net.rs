//! Networking layer between a bot and a game server.
//!
//! Packets are bincode-encoded and length-prefixed. The session core only
//! depends on the [`protocol::ProtocolClient`] trait; [`client`] is the
//! blocking TCP implementation and [`server`] a loopback server that speaks
//! the same protocol.

/// Blocking TCP client used on session worker threads.
pub mod client;

/// Framing and serialization errors.
pub mod errors;

/// Serverbound and clientbound packet types.
pub mod messages;

/// The protocol capability sessions are written against.
pub mod protocol;

/// Protocol versioning for the login handshake.
pub mod protocol_version;

/// Loopback game server driven by a `mio` event loop.
pub mod server;

/// Utilities for binary packet serialization and framing.
pub mod utils;
