//! Persistence and notification seams used by session pumps.
//!
//! Both traits are only ever invoked from a session's pump task on the
//! control plane, never from a worker thread.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::{
    account::{AccountId, ChatEvent},
    session::SessionState,
};

pub mod memory;
pub mod sink;

pub use memory::{MemoryEventSink, MemoryStateStore, RecordedEvent, StoreCall, StoreCallKind};
pub use sink::{Notification, SubscriberSink};

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Account has no persisted row
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Store is not reachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Notification delivery errors. Logged by the caller, never retried.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("subscriber queue full")]
    Full,
    #[error("sink closed")]
    Closed,
}

/// Durable record of account status and chat.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist whether the account is currently online
    async fn set_online(&self, account_id: &AccountId, online: bool) -> StoreResult<()>;

    /// Append a chat line to the log
    async fn save_chat(&self, event: &ChatEvent) -> StoreResult<()>;
}

/// What a session reports to observers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A state transition was applied.
    StateChanged {
        from: SessionState,
        to: SessionState,
        detail: Option<String>,
    },
    /// A chat line was received or confirmed sent.
    Chat(ChatEvent),
    /// The reconnect policy queued an attempt.
    ReconnectScheduled { attempt: u32, after: Duration },
    /// The reconnect policy ran out of attempts.
    ReconnectExhausted,
}

impl SessionEvent {
    /// Short machine-friendly name, used as the event kind by observers.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::Chat(_) => "chat",
            SessionEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            SessionEvent::ReconnectExhausted => "reconnect_exhausted",
        }
    }
}

/// Fire-and-forget observer of session events.
///
/// Implementations must not block: the caller is a pump draining a
/// session's bridge.
pub trait EventSink: Send + Sync {
    fn notify(&self, account_id: &AccountId, event: &SessionEvent) -> Result<(), SinkError>;
}
