//! The capability a session needs from a game protocol implementation.
//!
//! Everything here is blocking and runs on the session's worker thread.
//! Listener callbacks run on that same thread, inside [`ProtocolClient::poll`].

use std::{io, sync::Arc, time::Duration};
use thiserror::Error;

use super::messages::{ClientboundPacket, PacketKind, ServerboundPacket};
use crate::{account::ServerTarget, errors::FailureReason};

/// Errors raised by a protocol client.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection to {target} refused: {detail}")]
    Refused { target: String, detail: String },

    #[error("timed out {0}")]
    Timeout(String),

    #[error("login rejected: {0}")]
    Auth(String),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("not connected")]
    NotConnected,
}

impl ProtocolError {
    /// Map onto the session failure taxonomy.
    pub fn reason(&self) -> FailureReason {
        match self {
            ProtocolError::Refused { .. } => FailureReason::Refused,
            ProtocolError::Timeout(_) => FailureReason::Timeout,
            ProtocolError::Auth(_) => FailureReason::AuthError,
            ProtocolError::Io(error) if error.kind() == io::ErrorKind::TimedOut => {
                FailureReason::Timeout
            }
            ProtocolError::Violation(_)
            | ProtocolError::Io(_)
            | ProtocolError::NotConnected => FailureReason::ProtocolError,
        }
    }
}

/// Write half handed to listeners so they can answer on the spot.
pub trait PacketWriter {
    fn write_packet(&mut self, packet: &ServerboundPacket) -> Result<(), ProtocolError>;
}

/// Callback invoked on the worker thread for each packet of one kind.
pub type Listener = Box<dyn FnMut(&ClientboundPacket, &mut dyn PacketWriter) + Send>;

/// A blocking game protocol connection.
pub trait ProtocolClient: Send {
    /// Open the socket and complete the login phase.
    ///
    /// Blocks until the server accepts the login or `timeout` elapses.
    fn connect(
        &mut self,
        target: &ServerTarget,
        username: &str,
        online_mode: bool,
        timeout: Duration,
    ) -> Result<(), ProtocolError>;

    /// Subscribe `listener` to packets of `kind`. Several listeners may share a kind.
    fn register_listener(&mut self, kind: PacketKind, listener: Listener);

    fn write_packet(&mut self, packet: &ServerboundPacket) -> Result<(), ProtocolError>;

    /// Read and dispatch pending packets.
    ///
    /// Returns `Ok(false)` when the poll interval elapsed with nothing to
    /// dispatch, so the caller can service its own queue between reads.
    fn poll(&mut self) -> Result<bool, ProtocolError>;

    /// Close the socket. Safe to call more than once.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Builds a fresh client for every connection attempt.
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> Box<dyn ProtocolClient>;
}

impl<F> ClientFactory for F
where
    F: Fn() -> Box<dyn ProtocolClient> + Send + Sync,
{
    fn create(&self) -> Box<dyn ProtocolClient> {
        self()
    }
}

/// Shared handle to a factory.
pub type SharedClientFactory = Arc<dyn ClientFactory>;
