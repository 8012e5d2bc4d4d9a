//! Supervisor tuning knobs.

use std::time::Duration;

use crate::reconnect::ReconnectPolicy;

/// Timing parameters shared by every session a supervisor starts.
#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorConfig {
    /// Ceiling on reaching `Active` after `connect` is called.
    ///
    /// A failed `connect` returns once the session is `Closed`, so the
    /// caller waits at most `connect_timeout + stop_grace`.
    pub connect_timeout: Duration,
    /// How long a stopping worker thread may take before it is written off.
    pub stop_grace: Duration,
    /// Socket read bound; also how often a worker services its queue.
    pub poll_interval: Duration,
    pub anti_afk_period: Duration,
    /// How long a group send waits for each worker to confirm its write.
    pub send_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SupervisorConfig {
    /// Longest a failed `connect` can take to report back.
    pub fn connect_failure_bound(&self) -> Duration {
        self.connect_timeout + self.stop_grace
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            anti_afk_period: Duration::from_secs(60),
            send_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
