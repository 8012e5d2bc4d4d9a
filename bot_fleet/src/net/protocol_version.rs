//! Protocol versioning carried in the handshake.

use serde::{Deserialize, Serialize};

/// Version of the bot wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// V1: login, chat and keepalive only
    V1,
    /// V2: adds world changes and position updates
    V2,
}

impl ProtocolVersion {
    /// Get the current protocol version
    pub fn current() -> Self {
        ProtocolVersion::V2
    }

    /// Check whether a server speaking `self` accepts a client speaking `other`.
    ///
    /// A V2 server keeps serving V1 clients; a V1 server cannot serve V2
    /// clients since it would not understand position updates.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        matches!(
            (self, other),
            (ProtocolVersion::V1, ProtocolVersion::V1)
                | (ProtocolVersion::V2, ProtocolVersion::V2)
                | (ProtocolVersion::V2, ProtocolVersion::V1)
        )
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::current()
    }
}
