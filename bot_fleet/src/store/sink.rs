//! Fan-out of session events to in-process subscribers (UI bridges, log relays).

use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{EventSink, SessionEvent, SinkError};
use crate::account::AccountId;

/// An event as delivered to subscribers.
pub type Notification = (AccountId, SessionEvent);

/// [`EventSink`] that forwards to bounded subscriber channels.
///
/// Slow subscribers lose notifications rather than stalling a pump;
/// closed subscribers are dropped.
#[derive(Default)]
pub struct SubscriberSink {
    subscribers: Mutex<Vec<(u64, mpsc::Sender<Notification>)>>,
    next_id: Mutex<u64>,
}

impl SubscriberSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with room for `capacity` pending notifications.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Notification> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = {
            let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            *next_id += 1;
            *next_id
        };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sender));
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventSink for SubscriberSink {
    fn notify(&self, account_id: &AccountId, event: &SessionEvent) -> Result<(), SinkError> {
        let mut dropped = false;
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, sender)| {
                match sender.try_send((account_id.clone(), event.clone())) {
                    Ok(_) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("Subscriber {id} channel full, dropping notification");
                        dropped = true;
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::debug!("Subscriber {id} disconnected, removing");
                        false
                    }
                }
            });
        if dropped {
            Err(SinkError::Full)
        } else {
            Ok(())
        }
    }
}
