//! One connection attempt of one account.
//!
//! A [`BotSession`] is a handle; the work happens in two places:
//! - a worker thread ([`worker`]) that owns the blocking protocol client
//! - a pump task ([`pump`]) that drains the worker's bridge and applies
//!   state transitions, persistence and notifications
//!
//! The two only talk through [`bridge`].

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

pub mod bridge;
pub mod pump;
pub mod state;
pub mod timers;
pub mod worker;

pub use bridge::{BridgeEvent, CommandSender, WorkerCommand};
pub use state::SessionState;

use crate::{
    account::{Account, AccountId, ConnectionSettings, ServerTarget},
    config::SupervisorConfig,
    errors::{FailureReason, FleetError, FleetResult},
    net::{messages::ServerboundPacket, protocol::ProtocolClient},
    store::{EventSink, StateStore},
};
use pump::{Control, Pump};

/// Published state of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Detail of the last failure, if any.
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            last_error: None,
        }
    }
}

/// What a pump tells its supervisor.
#[derive(Clone, Debug)]
pub enum SessionNotice {
    /// An `Active` session was lost unexpectedly and may be retried.
    ReconnectRequested {
        account: Account,
        target: ServerTarget,
        settings: Arc<ConnectionSettings>,
        generation: u64,
        reason: FailureReason,
    },
    /// The session reached `Closed`; its map entry can go.
    Closed { account_id: AccountId, generation: u64 },
}

/// Collaborators a session reports to.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn StateStore>,
    pub sink: Arc<dyn EventSink>,
    pub notices: Option<mpsc::UnboundedSender<SessionNotice>>,
}

/// Handle to one running session.
#[derive(Clone)]
pub struct BotSession {
    account_id: AccountId,
    generation: u64,
    started_at: DateTime<Utc>,
    status: watch::Receiver<SessionStatus>,
    commands: CommandSender,
    control: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for BotSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotSession")
            .field("account_id", &self.account_id)
            .field("generation", &self.generation)
            .field("started_at", &self.started_at)
            .field("state", &self.state())
            .finish()
    }
}

impl BotSession {
    /// Spawn the worker thread and pump for a fresh attempt.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as both
    /// are running; use [`BotSession::wait_active`] for the outcome.
    pub fn start(
        account: Account,
        target: ServerTarget,
        settings: Arc<ConnectionSettings>,
        client: Box<dyn ProtocolClient>,
        config: &SupervisorConfig,
        deps: SessionDeps,
        generation: u64,
    ) -> FleetResult<Self> {
        let (bridge_tx, bridge_rx) = bridge::channel();
        let (commands, command_rx) = bridge::command_queue();
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(SessionState::Idle));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = worker::spawn(worker::WorkerContext {
            account_id: account.id.clone(),
            target: target.clone(),
            username: account.username(),
            online_mode: account.online_mode(),
            connect_timeout: config.connect_timeout,
            client,
            bridge: bridge_tx,
            commands: command_rx,
        })
        .map_err(|error| FleetError::Failed {
            account_id: account.id.clone(),
            reason: FailureReason::ProtocolError,
            detail: format!("failed to spawn worker thread: {error}"),
        })?;

        let session = Self {
            account_id: account.id.clone(),
            generation,
            started_at: Utc::now(),
            status: status_rx,
            commands: commands.clone(),
            control: control_tx,
        };

        let pump = Pump {
            account,
            target,
            settings,
            generation,
            store: deps.store,
            sink: deps.sink,
            notices: deps.notices,
            status: status_tx,
            commands,
            bridge: bridge_rx,
            control: control_rx,
            worker: Some(worker),
            stop_grace: config.stop_grace,
            anti_afk_period: config.anti_afk_period,
        };
        tokio::spawn(pump.run());

        Ok(session)
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Distinguishes attempts for the same account.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Ask for a graceful stop. Returns immediately.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Force the session into `Error(reason)`.
    ///
    /// The caller owns reporting this failure, so it never schedules a
    /// reconnect, even when the session had already reached `Active`.
    pub fn fail(&self, reason: FailureReason, detail: impl Into<String>) {
        let _ = self.control.send(Control::Fail {
            reason,
            detail: detail.into(),
        });
    }

    /// Wait until the session is `Active` or has failed.
    ///
    /// On timeout the session is left as is; the caller decides whether to
    /// fail it.
    pub async fn wait_active(&self, timeout: Duration) -> Result<(), (FailureReason, String)> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|status| status.state.is_active() || status.state.is_stopping()),
        )
        .await;
        match waited {
            Err(_) => Err((
                FailureReason::Timeout,
                format!("not joined within {}s", timeout.as_secs()),
            )),
            Ok(Err(_)) => Err((
                FailureReason::ProtocolError,
                "session ended unexpectedly".to_string(),
            )),
            Ok(Ok(status)) if status.state.is_active() => Ok(()),
            Ok(Ok(status)) => Err((
                status.state.failure().unwrap_or(FailureReason::ProtocolError),
                status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("session {}", status.state)),
            )),
        }
    }

    /// Wait until the session is `Closed`. The pump bounds this by its stop grace.
    pub async fn wait_closed(&self) {
        let mut status = self.status.clone();
        // An error means the pump is gone, which only happens after `Closed`.
        let _ = status.wait_for(|status| status.state.is_terminal()).await;
    }

    /// Queue a packet on the worker's write path without waiting.
    pub fn write(&self, packet: ServerboundPacket) -> bool {
        self.state().is_active() && self.commands.write(packet)
    }

    /// Send a chat line and wait for the worker to write it.
    pub async fn send_chat(&self, text: &str) -> FleetResult<()> {
        if !self.state().is_active() {
            return Err(FleetError::NotConnected(self.account_id.clone()));
        }
        self.commands
            .write_confirmed(ServerboundPacket::Chat {
                message: text.to_string(),
            })
            .await
            .map_err(|error| {
                log::debug!("{}: chat not sent: {error}", self.account_id);
                FleetError::SessionClosed(self.account_id.clone())
            })
    }
}
