//! Automatic reconnection after an unexpected disconnect.
//!
//! Attempts run at fixed offsets from the first failure, not from each
//! other: by default +5m, +10m, +15m, then a last try at +1h15m.

use std::{future::Future, time::Duration};
use tokio::time::{Instant, sleep_until};

use crate::errors::FailureReason;

/// When to retry, measured from the first failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    offsets: Vec<Duration>,
}

impl ReconnectPolicy {
    /// Offsets are sorted; duplicates are kept.
    pub fn new(mut offsets: Vec<Duration>) -> Self {
        offsets.sort();
        Self { offsets }
    }

    pub fn offsets(&self) -> &[Duration] {
        &self.offsets
    }

    pub fn attempts(&self) -> usize {
        self.offsets.len()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(5 * 60),
            Duration::from_secs(10 * 60),
            Duration::from_secs(15 * 60),
            Duration::from_secs(75 * 60),
        ])
    }
}

/// How a reconnect schedule ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Attempt number `n` (1-based) reached `Active`.
    Reconnected(u32),
    /// An attempt was rejected with an authentication error.
    Abandoned(u32),
    /// Every attempt failed.
    Exhausted,
}

/// Run `policy` against `attempt`, starting the clock at `first_failure`.
///
/// `on_scheduled` is called before each wait with the attempt number and
/// the offset it is due at. `attempt` returns the failure reason of an
/// unsuccessful try.
pub async fn run_schedule<A, Fut, S>(
    policy: &ReconnectPolicy,
    first_failure: Instant,
    mut on_scheduled: S,
    mut attempt: A,
) -> ScheduleOutcome
where
    A: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), FailureReason>>,
    S: FnMut(u32, Duration),
{
    for (index, offset) in policy.offsets().iter().enumerate() {
        let number = index as u32 + 1;
        on_scheduled(number, *offset);
        sleep_until(first_failure + *offset).await;
        match attempt(number).await {
            Ok(()) => return ScheduleOutcome::Reconnected(number),
            Err(FailureReason::AuthError) => return ScheduleOutcome::Abandoned(number),
            Err(_) => {}
        }
    }
    ScheduleOutcome::Exhausted
}
