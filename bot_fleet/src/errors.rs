//! Failure taxonomy and supervisor-facing errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::account::AccountId;

/// Why a connection attempt or a live session failed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum FailureReason {
    /// Target closed or unreachable.
    Refused,
    /// Handshake did not complete within its bound.
    Timeout,
    /// Decode failure, unexpected packet or connection lost mid-session.
    ProtocolError,
    /// Identity rejected by the server.
    AuthError,
}

impl FailureReason {
    /// Whether an unexpected disconnect with this reason may be retried by
    /// the reconnect policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthError)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            Self::Refused => "refused",
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol error",
            Self::AuthError => "authentication error",
        };
        write!(f, "{repr}")
    }
}

/// Errors returned by the connection supervisor.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The session never reached `Active`.
    #[error("{account_id} failed to connect ({reason}): {detail}")]
    Failed {
        account_id: AccountId,
        reason: FailureReason,
        detail: String,
    },

    /// No live session for the account.
    #[error("{0} is not connected")]
    NotConnected(AccountId),

    /// The session closed before the request could be delivered.
    #[error("session for {0} closed")]
    SessionClosed(AccountId),

    /// The worker did not confirm a write in time.
    #[error("{0} did not confirm the write in time")]
    WriteTimeout(AccountId),

    /// Settings forbid starting this account.
    #[error("{0}")]
    Rejected(String),
}

impl FleetError {
    /// Failure reason, when the error came from a connection attempt.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            FleetError::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Reason string safe to hand to API clients; no hostnames or io details.
    pub fn client_message(&self) -> String {
        match self {
            FleetError::Failed { reason, .. } => format!("Connection failed: {reason}"),
            FleetError::NotConnected(_) => "Account is not connected".to_string(),
            FleetError::SessionClosed(_) => "Session closed".to_string(),
            FleetError::WriteTimeout(_) => "Request timed out".to_string(),
            FleetError::Rejected(msg) => msg.clone(),
        }
    }
}

/// Result type for supervisor operations
pub type FleetResult<T> = Result<T, FleetError>;
