//! The control-plane side of a session.
//!
//! One tokio task per session drains the bridge in order and is the only
//! code that applies state transitions, writes to the [`StateStore`] or
//! notifies the [`EventSink`] for that session.

use std::{sync::Arc, thread, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};

use super::{
    SessionNotice, SessionState, SessionStatus,
    bridge::{BridgeEvent, BridgeReceiver, CommandSender},
    timers::{TimerContext, Timers},
};
use crate::{
    account::{Account, AccountId, ChatDirection, ChatEvent, ConnectionSettings, ServerTarget},
    errors::FailureReason,
    store::{EventSink, SessionEvent, StateStore},
};

/// Requests from session handles to the pump.
#[derive(Debug)]
pub enum Control {
    /// Caller-initiated graceful stop.
    Stop,
    /// Force the session into `Error`, e.g. when the connect ceiling passes.
    /// Never triggers a reconnect.
    Fail {
        reason: FailureReason,
        detail: String,
    },
}

pub struct Pump {
    pub(super) account: Account,
    pub(super) target: ServerTarget,
    pub(super) settings: Arc<ConnectionSettings>,
    pub(super) generation: u64,
    pub(super) store: Arc<dyn StateStore>,
    pub(super) sink: Arc<dyn EventSink>,
    pub(super) notices: Option<mpsc::UnboundedSender<SessionNotice>>,
    pub(super) status: watch::Sender<SessionStatus>,
    pub(super) commands: CommandSender,
    pub(super) bridge: BridgeReceiver,
    pub(super) control: mpsc::UnboundedReceiver<Control>,
    pub(super) worker: Option<thread::JoinHandle<()>>,
    pub(super) stop_grace: Duration,
    pub(super) anti_afk_period: Duration,
}

/// Mutable bookkeeping of a running pump.
struct RunState {
    timers: Timers,
    grace_deadline: Option<Instant>,
    stop_requested: bool,
    control_open: bool,
}

impl Pump {
    fn account_id(&self) -> &AccountId {
        &self.account.id
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn timer_context(&self) -> TimerContext {
        TimerContext {
            account_id: self.account.id.clone(),
            settings: self.settings.clone(),
            commands: self.commands.clone(),
            status: self.status.subscribe(),
            anti_afk_period: self.anti_afk_period,
        }
    }

    /// Drive the session until it is `Closed`.
    pub async fn run(mut self) {
        let mut run = RunState {
            timers: Timers::new(),
            grace_deadline: None,
            stop_requested: false,
            control_open: true,
        };
        self.transition(&mut run, SessionState::Connecting, None).await;

        loop {
            let deadline = run.grace_deadline;
            tokio::select! {
                event = self.bridge.recv() => match event {
                    Some(event) => self.handle_event(&mut run, event).await,
                    None => break,
                },
                control = self.control.recv(), if run.control_open => match control {
                    Some(control) => self.handle_control(&mut run, control).await,
                    None => run.control_open = false,
                },
                _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                    log::warn!(
                        "{}: leaked worker thread, still alive {:?} after stop; forcing close",
                        self.account_id(),
                        self.stop_grace
                    );
                    // Detach: the thread may outlive us but nothing can address it.
                    drop(self.worker.take());
                    self.transition(&mut run, SessionState::Closed, Some("leaked worker thread".to_string())).await;
                    self.notify_closed();
                    return;
                }
            }
        }

        self.join_worker(&mut run).await;
        if !self.state().is_stopping() {
            self.fail(
                &mut run,
                FailureReason::ProtocolError,
                "worker exited without reporting".to_string(),
            )
            .await;
        }
        self.transition(&mut run, SessionState::Closed, None).await;
        self.notify_closed();
    }

    /// The bridge closed, so the thread has left its run loop; reap it.
    async fn join_worker(&mut self, run: &mut RunState) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || handle.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            log::error!("{}: worker thread panicked", self.account_id());
            if !self.state().is_stopping() {
                self.fail(run, FailureReason::ProtocolError, "worker thread panicked".to_string())
                    .await;
            }
        }
    }

    async fn handle_event(&mut self, run: &mut RunState, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected => {
                self.transition(run, SessionState::Joined, None).await;
            }
            BridgeEvent::ConnectFailed { reason, detail } => {
                self.fail(run, reason, detail).await;
            }
            BridgeEvent::JoinedGame { dimension } => {
                if self.transition(run, SessionState::Active, None).await {
                    log::info!("{}: joined {dimension}", self.account_id());
                    run.timers.on_active(&self.timer_context());
                }
            }
            BridgeEvent::WorldChanged { dimension } => {
                if self.state().is_active() {
                    log::info!("{}: moved to {dimension}", self.account_id());
                    run.timers.on_world_change(&self.timer_context());
                }
            }
            BridgeEvent::Chat { text } => {
                self.record_chat(text, ChatDirection::Inbound).await;
            }
            BridgeEvent::ChatSent { text } => {
                self.record_chat(text, ChatDirection::Outbound).await;
            }
            BridgeEvent::Disconnected { reason } => {
                if !run.stop_requested {
                    self.fail(run, FailureReason::ProtocolError, format!("kicked: {reason}"))
                        .await;
                }
            }
            BridgeEvent::ConnectionLost { reason, detail } => {
                if !run.stop_requested {
                    self.fail(run, reason, detail).await;
                }
            }
        }
    }

    async fn handle_control(&mut self, run: &mut RunState, control: Control) {
        match control {
            Control::Stop => {
                run.stop_requested = true;
                if self.transition(run, SessionState::Disconnecting, None).await {
                    self.request_worker_stop(run);
                }
            }
            Control::Fail { reason, detail } => {
                // The caller reports this failure itself; it is never retried.
                run.stop_requested = true;
                self.fail(run, reason, detail).await;
            }
        }
    }

    fn request_worker_stop(&self, run: &mut RunState) {
        self.commands.stop();
        if run.grace_deadline.is_none() {
            run.grace_deadline = Some(Instant::now() + self.stop_grace);
        }
    }

    /// Move to `Error(reason)` and, for an unexpected mid-session loss,
    /// ask the supervisor to schedule reconnects.
    async fn fail(&mut self, run: &mut RunState, reason: FailureReason, detail: String) {
        let was_active = self.state().is_active();
        if !self
            .transition(run, SessionState::Error(reason), Some(detail.clone()))
            .await
        {
            return;
        }
        log::warn!("{}: session failed ({reason}): {detail}", self.account_id());
        self.request_worker_stop(run);

        if was_active
            && !run.stop_requested
            && self.settings.auto_reconnect_enabled
            && reason.is_retryable()
        {
            self.send_notice(SessionNotice::ReconnectRequested {
                account: self.account.clone(),
                target: self.target.clone(),
                settings: self.settings.clone(),
                generation: self.generation,
                reason,
            });
        }
    }

    /// Apply one transition with its side effects. Returns `false` and does
    /// nothing when the table rejects it.
    ///
    /// Order: timers stop, then persistence, then the new state is
    /// published, then observers are notified.
    async fn transition(
        &mut self,
        run: &mut RunState,
        next: SessionState,
        detail: Option<String>,
    ) -> bool {
        let current = self.state();
        if !current.can_transition_to(&next) {
            log::debug!(
                "{}: ignoring transition {current} -> {next}",
                self.account_id()
            );
            return false;
        }

        if current.is_active() {
            run.timers.stop_all();
        }

        match next {
            SessionState::Active => self.persist_online(true).await,
            SessionState::Disconnecting | SessionState::Error(_) => {
                self.persist_online(false).await
            }
            _ => {}
        }

        self.status.send_modify(|status| {
            status.state = next;
            if detail.is_some() {
                status.last_error = detail.clone();
            }
        });
        log::debug!("{}: {current} -> {next}", self.account_id());

        self.notify(&SessionEvent::StateChanged {
            from: current,
            to: next,
            detail,
        });
        true
    }

    async fn persist_online(&self, online: bool) {
        if let Err(error) = self.store.set_online(self.account_id(), online).await {
            log::error!(
                "{}: failed to persist online={online}: {error}",
                self.account_id()
            );
        }
    }

    async fn record_chat(&self, text: String, direction: ChatDirection) {
        let event = ChatEvent::new(self.account_id().clone(), text, direction);
        if let Err(error) = self.store.save_chat(&event).await {
            log::error!("{}: failed to save chat: {error}", self.account_id());
        }
        self.notify(&SessionEvent::Chat(event));
    }

    fn notify(&self, event: &SessionEvent) {
        if let Err(error) = self.sink.notify(self.account_id(), event) {
            log::warn!(
                "{}: {} notification not delivered: {error}",
                self.account_id(),
                event.kind()
            );
        }
    }

    fn notify_closed(&self) {
        self.send_notice(SessionNotice::Closed {
            account_id: self.account.id.clone(),
            generation: self.generation,
        });
    }

    fn send_notice(&self, notice: SessionNotice) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice);
        }
    }
}
