//! Owner of every session: one live session per account, start and stop
//! serialized per account, group sends fanned out to the sessions' write
//! paths.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex as AsyncMutex, RwLock, mpsc},
    task::{JoinHandle, JoinSet},
    time::Instant,
};

use crate::{
    account::{Account, AccountId, AccountKind, ConnectionSettings, ServerTarget},
    config::SupervisorConfig,
    errors::{FailureReason, FleetError, FleetResult},
    net::protocol::SharedClientFactory,
    reconnect::{ScheduleOutcome, run_schedule},
    session::{BotSession, SessionDeps, SessionNotice, SessionState},
    store::{EventSink, SessionEvent, StateStore},
};

/// Gap between the two commands of [`ConnectionSupervisor::clear_inventory`].
const CLEAR_INVENTORY_GAP: Duration = Duration::from_secs(1);

struct ReconnectTask {
    id: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    config: SupervisorConfig,
    factory: SharedClientFactory,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,

    /// Live or closing sessions. Only the supervisor writes this map.
    sessions: RwLock<HashMap<AccountId, BotSession>>,

    /// Serializes start/stop for one account.
    account_locks: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,

    /// Pending reconnect schedules
    reconnects: Mutex<HashMap<AccountId, ReconnectTask>>,

    notices: mpsc::UnboundedSender<SessionNotice>,
    next_generation: AtomicU64,
}

/// Connection supervisor for a fleet of accounts.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Create a supervisor
    ///
    /// Must be called from within a tokio runtime: it spawns the task that
    /// reaps closed sessions and starts reconnect schedules.
    ///
    /// # Arguments
    ///
    /// * `config` - Timeouts, anti-afk period and reconnect policy
    /// * `factory` - Builds one protocol client per connection attempt
    /// * `store` - Persists online status and chat
    /// * `sink` - Receives session notifications
    pub fn new(
        config: SupervisorConfig,
        factory: SharedClientFactory,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            factory,
            store,
            sink,
            sessions: RwLock::new(HashMap::new()),
            account_locks: Mutex::new(HashMap::new()),
            reconnects: Mutex::new(HashMap::new()),
            notices,
            next_generation: AtomicU64::new(1),
        });
        tokio::spawn(run_notices(Arc::downgrade(&inner), notice_rx));
        Self { inner }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Connect an account and wait until it is `Active`.
    ///
    /// An existing session for the account is fully stopped first, and any
    /// pending reconnect schedule is cancelled.
    ///
    /// # Errors
    ///
    /// `FleetError::Failed` with the failure reason when the session does not
    /// reach `Active` within the connect timeout. The session is closed and
    /// removed before this returns, which bounds the wait by
    /// [`SupervisorConfig::connect_failure_bound`].
    pub async fn connect(
        &self,
        account: Account,
        target: ServerTarget,
        settings: ConnectionSettings,
    ) -> FleetResult<()> {
        self.cancel_reconnect(&account.id).await;
        self.start(account, target, Arc::new(settings)).await
    }

    async fn start(
        &self,
        account: Account,
        target: ServerTarget,
        settings: Arc<ConnectionSettings>,
    ) -> FleetResult<()> {
        if account.kind == AccountKind::Offline && !settings.offline_accounts_enabled {
            return Err(FleetError::Rejected(
                "Offline accounts are disabled".to_string(),
            ));
        }

        let account_id = account.id.clone();
        let lock = self.account_lock(&account_id);
        let _guard = lock.lock().await;

        self.stop_existing(&account_id).await;

        let config = &self.inner.config;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        log::info!("{account_id}: connecting to {target}");
        // Taken before the worker exists: no await may separate spawning a
        // session from registering it, or a cancelled caller would orphan it.
        let mut sessions = self.inner.sessions.write().await;
        let session = BotSession::start(
            account,
            target,
            settings,
            self.inner.factory.create(),
            config,
            SessionDeps {
                store: self.inner.store.clone(),
                sink: self.inner.sink.clone(),
                notices: Some(self.inner.notices.clone()),
            },
            generation,
        )?;
        sessions.insert(account_id.clone(), session.clone());
        drop(sessions);

        match session.wait_active(config.connect_timeout).await {
            Ok(()) => {
                log::info!("{account_id}: connected");
                Ok(())
            }
            Err((reason, detail)) => {
                // No-op unless the wait timed out while the session was still live.
                session.fail(reason, detail.clone());
                session.wait_closed().await;
                self.remove_if_current(&account_id, generation).await;
                log::warn!("{account_id}: connect failed ({reason}): {detail}");
                Err(FleetError::Failed {
                    account_id,
                    reason,
                    detail,
                })
            }
        }
    }

    /// Gracefully stop an account's session and wait for it to close.
    ///
    /// Also cancels a pending reconnect schedule.
    ///
    /// # Returns
    ///
    /// * `bool` - `false` if the account had no session
    pub async fn disconnect(&self, account_id: &AccountId) -> bool {
        let cancelled = self.cancel_reconnect(account_id).await;
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;
        self.stop_existing(account_id).await || cancelled
    }

    /// Stop every session and cancel every reconnect schedule.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of sessions stopped
    pub async fn disconnect_all(&self) -> usize {
        let schedules: Vec<ReconnectTask> = self
            .reconnects()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in &schedules {
            task.handle.abort();
        }
        for task in schedules {
            let _ = task.handle.await;
        }

        let account_ids: Vec<AccountId> =
            self.inner.sessions.read().await.keys().cloned().collect();
        let mut stops = JoinSet::new();
        for account_id in account_ids {
            let supervisor = self.clone();
            stops.spawn(async move { supervisor.disconnect(&account_id).await });
        }

        let mut stopped = 0;
        while let Some(result) = stops.join_next().await {
            if matches!(result, Ok(true)) {
                stopped += 1;
            }
        }
        log::info!("Stopped {stopped} sessions");
        stopped
    }

    /// Send `text` as chat from each account, concurrently.
    ///
    /// Accounts without an `Active` session are skipped. Duplicate ids send once.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of accounts whose worker confirmed the write
    pub async fn send_from_many(&self, account_ids: &[AccountId], text: &str) -> usize {
        let mut seen = HashSet::new();
        let sessions: Vec<BotSession> = {
            let sessions = self.inner.sessions.read().await;
            account_ids
                .iter()
                .filter(|id| seen.insert(*id))
                .filter_map(|id| {
                    let session = sessions.get(id).cloned();
                    if session.is_none() {
                        log::debug!("{id}: not connected, skipping send");
                    }
                    session
                })
                .collect()
        };

        let mut sends = JoinSet::new();
        for session in sessions {
            let text = text.to_string();
            let timeout = self.inner.config.send_timeout;
            sends.spawn(async move { send_with_timeout(&session, &text, timeout).await.is_ok() });
        }

        let mut delivered = 0;
        while let Some(result) = sends.join_next().await {
            if matches!(result, Ok(true)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send one chat line from one account.
    pub async fn send_chat(&self, account_id: &AccountId, text: &str) -> FleetResult<()> {
        let session = self
            .session(account_id)
            .await
            .ok_or_else(|| FleetError::NotConnected(account_id.clone()))?;
        send_with_timeout(&session, text, self.inner.config.send_timeout).await
    }

    /// Send a server command, adding the leading `/` when it is missing.
    pub async fn send_command(&self, account_id: &AccountId, command: &str) -> FleetResult<()> {
        let command = command.trim();
        let command = if command.starts_with('/') {
            command.to_string()
        } else {
            format!("/{command}")
        };
        self.send_chat(account_id, &command).await
    }

    /// Empty the inventory and clear effects, one second apart.
    ///
    /// Succeeds if at least one of the two commands was delivered.
    pub async fn clear_inventory(&self, account_id: &AccountId) -> FleetResult<()> {
        let cleared = self.send_command(account_id, "/clear").await;
        tokio::time::sleep(CLEAR_INVENTORY_GAP).await;
        let effects = self.send_command(account_id, "/effect clear @s").await;
        match (cleared, effects) {
            (Err(_), Err(error)) => Err(error),
            _ => Ok(()),
        }
    }

    pub async fn is_connected(&self, account_id: &AccountId) -> bool {
        self.session_state(account_id)
            .await
            .is_some_and(|state| state.is_active())
    }

    /// Accounts whose session is `Active`, sorted.
    pub async fn list_connected(&self) -> Vec<AccountId> {
        let mut connected: Vec<AccountId> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.state().is_active())
            .map(|(id, _)| id.clone())
            .collect();
        connected.sort();
        connected
    }

    /// Current state of the account's session, if it has one.
    pub async fn session_state(&self, account_id: &AccountId) -> Option<SessionState> {
        self.session(account_id).await.map(|session| session.state())
    }

    /// Handle to the account's session, if it has one.
    pub async fn session(&self, account_id: &AccountId) -> Option<BotSession> {
        self.inner.sessions.read().await.get(account_id).cloned()
    }

    /// Number of sessions in the map, closing ones included.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub fn has_pending_reconnect(&self, account_id: &AccountId) -> bool {
        self.reconnects().contains_key(account_id)
    }

    fn account_lock(&self, account_id: &AccountId) -> Arc<AsyncMutex<()>> {
        self.inner
            .account_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account_id.clone())
            .or_default()
            .clone()
    }

    fn reconnects(&self) -> std::sync::MutexGuard<'_, HashMap<AccountId, ReconnectTask>> {
        self.inner
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop and reap the account's session. Caller holds the account lock.
    async fn stop_existing(&self, account_id: &AccountId) -> bool {
        let Some(session) = self.session(account_id).await else {
            return false;
        };
        log::info!("{account_id}: stopping session ({})", session.state());
        session.stop();
        session.wait_closed().await;
        self.remove_if_current(account_id, session.generation())
            .await;
        true
    }

    async fn remove_if_current(&self, account_id: &AccountId, generation: u64) {
        let mut sessions = self.inner.sessions.write().await;
        if sessions
            .get(account_id)
            .is_some_and(|session| session.generation() == generation)
        {
            sessions.remove(account_id);
            log::debug!("{account_id}: session {generation} removed");
        }
    }

    /// Abort the account's reconnect schedule and wait until its task is
    /// gone, so an attempt it had in flight is either registered or never
    /// started.
    async fn cancel_reconnect(&self, account_id: &AccountId) -> bool {
        let Some(task) = self.reconnects().remove(account_id) else {
            return false;
        };
        task.handle.abort();
        let _ = task.handle.await;
        log::info!("{account_id}: pending reconnect cancelled");
        true
    }

    /// Start a reconnect schedule, replacing any older one for the account.
    fn schedule_reconnect(
        &self,
        account: Account,
        target: ServerTarget,
        settings: Arc<ConnectionSettings>,
    ) {
        let account_id = account.id.clone();
        let id = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let supervisor = self.clone();
        let first_failure = Instant::now();

        // Held across the spawn so the runner's own cleanup sees its entry.
        let mut reconnects = self.reconnects();
        let handle = tokio::spawn(async move {
            let account_id = account.id.clone();
            let sink = supervisor.inner.sink.clone();
            let policy = supervisor.inner.config.reconnect.clone();
            let outcome = run_schedule(
                &policy,
                first_failure,
                |attempt, after| {
                    log::info!(
                        "{account_id}: reconnect attempt {attempt} due {}s after failure",
                        after.as_secs()
                    );
                    notify(
                        sink.as_ref(),
                        &account_id,
                        &SessionEvent::ReconnectScheduled { attempt, after },
                    );
                },
                |attempt| {
                    let supervisor = supervisor.clone();
                    let account = account.clone();
                    let target = target.clone();
                    let settings = settings.clone();
                    async move {
                        let account_id = account.id.clone();
                        supervisor
                            .start(account, target, settings)
                            .await
                            .map_err(|error| {
                                log::warn!("{account_id}: reconnect attempt {attempt} failed: {error}");
                                // Anything but a connection failure means settings now forbid the account.
                                error.reason().unwrap_or(FailureReason::AuthError)
                            })
                    }
                },
            )
            .await;

            match outcome {
                ScheduleOutcome::Reconnected(attempt) => {
                    log::info!("{account_id}: reconnected on attempt {attempt}");
                }
                ScheduleOutcome::Abandoned(attempt) => {
                    log::warn!(
                        "{account_id}: reconnect abandoned after attempt {attempt}: authentication rejected"
                    );
                }
                ScheduleOutcome::Exhausted => {
                    log::warn!("{account_id}: reconnect attempts exhausted, manual reconnect required");
                    notify(sink.as_ref(), &account_id, &SessionEvent::ReconnectExhausted);
                }
            }

            let mut reconnects = supervisor.reconnects();
            if reconnects.get(&account_id).is_some_and(|task| task.id == id) {
                reconnects.remove(&account_id);
            }
        });

        if let Some(previous) = reconnects.insert(account_id, ReconnectTask { id, handle }) {
            previous.handle.abort();
        }
    }
}

async fn send_with_timeout(session: &BotSession, text: &str, timeout: Duration) -> FleetResult<()> {
    let account_id = session.account_id();
    match tokio::time::timeout(timeout, session.send_chat(text)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => {
            log::debug!("{account_id}: send failed: {error}");
            Err(error)
        }
        Err(_) => {
            log::warn!("{account_id}: write not confirmed within {timeout:?}");
            Err(FleetError::WriteTimeout(account_id.clone()))
        }
    }
}

fn notify(sink: &dyn EventSink, account_id: &AccountId, event: &SessionEvent) {
    if let Err(error) = sink.notify(account_id, event) {
        log::warn!("{account_id}: {} notification not delivered: {error}", event.kind());
    }
}

/// Reap closed sessions and start reconnect schedules until the supervisor
/// is dropped.
async fn run_notices(inner: Weak<Inner>, mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let supervisor = ConnectionSupervisor { inner };
        match notice {
            SessionNotice::Closed {
                account_id,
                generation,
            } => {
                supervisor.remove_if_current(&account_id, generation).await;
            }
            SessionNotice::ReconnectRequested {
                account,
                target,
                settings,
                reason,
                ..
            } => {
                log::info!("{}: lost connection ({reason}), scheduling reconnect", account.id);
                supervisor.schedule_reconnect(account, target, settings);
            }
        }
    }
}
