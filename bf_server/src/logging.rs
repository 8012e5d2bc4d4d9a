//! Structured logging configuration.
//!
//! The library logs through the `log` facade; `init` installs a tracing
//! subscriber that also captures those records.

use bot_fleet::store::{Notification, SessionEvent};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging
///
/// Log levels are configurable via the `RUST_LOG` env var.
///
/// # Example
///
/// ```no_run
/// use bf_server::logging;
///
/// #[tokio::main]
/// async fn main() {
///     logging::init();
///     tracing::info!("Fleet starting");
/// }
/// ```
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Structured logging initialized");
}

/// Log a session notification with structured fields
///
/// Failures and exhausted reconnect schedules are warnings, everything else
/// is info. Chat lines go to debug.
pub fn log_session_event((account_id, event): &Notification) {
    let account = account_id.as_str();
    let kind = event.kind();
    match event {
        SessionEvent::StateChanged { from, to, detail } if to.failure().is_some() => {
            tracing::warn!(
                account,
                event = kind,
                from = %from,
                to = %to,
                detail = detail.as_deref(),
                "Session failed"
            );
        }
        SessionEvent::StateChanged { from, to, detail } => {
            tracing::info!(
                account,
                event = kind,
                from = %from,
                to = %to,
                detail = detail.as_deref(),
                "Session state changed"
            );
        }
        SessionEvent::Chat(chat) => {
            tracing::debug!(
                account,
                event = kind,
                outgoing = chat.is_outgoing(),
                text = %chat.text,
                "Chat"
            );
        }
        SessionEvent::ReconnectScheduled { attempt, after } => {
            tracing::info!(
                account,
                event = kind,
                attempt,
                after_secs = after.as_secs(),
                "Reconnect scheduled"
            );
        }
        SessionEvent::ReconnectExhausted => {
            tracing::warn!(account, event = kind, "Reconnect attempts exhausted");
        }
    }
}
