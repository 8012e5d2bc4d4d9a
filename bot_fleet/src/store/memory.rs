//! In-memory store and sink.
//!
//! Used by dry runs without a database and by tests, which inspect the
//! recorded calls (including the thread each call came from).

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    thread,
};

use super::{EventSink, SessionEvent, SinkError, StateStore, StoreResult};
use crate::account::{AccountId, ChatEvent};

#[derive(Clone, Debug, PartialEq)]
pub enum StoreCallKind {
    SetOnline(bool),
    SaveChat(String),
}

/// One recorded store invocation.
#[derive(Clone, Debug)]
pub struct StoreCall {
    pub account_id: AccountId,
    pub kind: StoreCallKind,
    /// Name of the calling thread, if it had one.
    pub thread: Option<String>,
}

fn current_thread_name() -> Option<String> {
    thread::current().name().map(str::to_string)
}

#[derive(Default)]
struct StoreInner {
    online: HashMap<AccountId, bool>,
    chats: Vec<ChatEvent>,
    calls: Vec<StoreCall>,
}

/// [`StateStore`] kept in process memory.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last persisted online flag, `None` if never written.
    pub fn online(&self, account_id: &AccountId) -> Option<bool> {
        self.lock().online.get(account_id).copied()
    }

    pub fn chats(&self) -> Vec<ChatEvent> {
        self.lock().chats.clone()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Online flags written for one account, in order.
    pub fn online_history(&self, account_id: &AccountId) -> Vec<bool> {
        self.lock()
            .calls
            .iter()
            .filter(|call| &call.account_id == account_id)
            .filter_map(|call| match call.kind {
                StoreCallKind::SetOnline(online) => Some(online),
                StoreCallKind::SaveChat(_) => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn set_online(&self, account_id: &AccountId, online: bool) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.online.insert(account_id.clone(), online);
        inner.calls.push(StoreCall {
            account_id: account_id.clone(),
            kind: StoreCallKind::SetOnline(online),
            thread: current_thread_name(),
        });
        Ok(())
    }

    async fn save_chat(&self, event: &ChatEvent) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.chats.push(event.clone());
        inner.calls.push(StoreCall {
            account_id: event.account_id.clone(),
            kind: StoreCallKind::SaveChat(event.text.clone()),
            thread: current_thread_name(),
        });
        Ok(())
    }
}

/// A notification captured by [`MemoryEventSink`].
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub account_id: AccountId,
    pub event: SessionEvent,
    pub thread: Option<String>,
}

/// [`EventSink`] that keeps every notification.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events for one account, in delivery order.
    pub fn events_for(&self, account_id: &AccountId) -> Vec<SessionEvent> {
        self.events()
            .into_iter()
            .filter(|recorded| &recorded.account_id == account_id)
            .map(|recorded| recorded.event)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn notify(&self, account_id: &AccountId, event: &SessionEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                account_id: account_id.clone(),
                event: event.clone(),
                thread: current_thread_name(),
            });
        Ok(())
    }
}
