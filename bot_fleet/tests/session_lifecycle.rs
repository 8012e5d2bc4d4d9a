//! Session lifecycle edge cases, driven by scripted protocol clients.

mod common;

use async_trait::async_trait;
use bot_fleet::{
    Account, AccountId, ChatEvent, ConnectionSettings, ConnectionSupervisor, FailureReason,
    FleetError, MemoryEventSink, MemoryStateStore, ServerTarget, SessionEvent, SessionState,
    SharedClientFactory, StateStore, SupervisorConfig,
    net::{
        messages::{ClientboundPacket, PacketKind, ServerboundPacket},
        protocol::{Listener, PacketWriter, ProtocolClient, ProtocolError},
    },
    store::StoreResult,
};
use common::{eventually_async, fast_config, fleet_with, quiet_settings};
use std::{
    collections::HashMap,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// What the scripted client does once the join packet has been delivered.
#[derive(Clone, Copy)]
enum AfterJoin {
    /// Never joins at all; idles in `Joined`.
    NeverJoin,
    /// Blocks in `poll` far longer than any grace period.
    Hang,
    /// Panics on the worker thread shortly after joining.
    Panic,
    /// Joins and then stays quietly connected.
    Idle,
}

struct ScriptedClient {
    behavior: AfterJoin,
    joined: bool,
    listeners: HashMap<PacketKind, Vec<Listener>>,
}

struct NullWriter;

impl PacketWriter for NullWriter {
    fn write_packet(&mut self, _packet: &ServerboundPacket) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl ProtocolClient for ScriptedClient {
    fn connect(
        &mut self,
        _target: &ServerTarget,
        _username: &str,
        _online_mode: bool,
        _timeout: Duration,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn register_listener(&mut self, kind: PacketKind, listener: Listener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    fn write_packet(&mut self, _packet: &ServerboundPacket) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn poll(&mut self) -> Result<bool, ProtocolError> {
        if matches!(self.behavior, AfterJoin::NeverJoin) {
            thread::sleep(Duration::from_millis(10));
            return Ok(false);
        }
        if !self.joined {
            self.joined = true;
            let join = ClientboundPacket::JoinGame {
                entity_id: 1,
                dimension: "minecraft:overworld".to_string(),
            };
            for listener in self.listeners.get_mut(&PacketKind::JoinGame).into_iter().flatten() {
                listener(&join, &mut NullWriter);
            }
            return Ok(true);
        }
        match self.behavior {
            AfterJoin::Hang => {
                thread::sleep(Duration::from_secs(60));
                Ok(false)
            }
            AfterJoin::Panic => {
                thread::sleep(Duration::from_millis(300));
                panic!("decoder bug");
            }
            AfterJoin::Idle => {
                thread::sleep(Duration::from_millis(10));
                Ok(false)
            }
            AfterJoin::NeverJoin => Ok(false),
        }
    }

    fn disconnect(&mut self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

fn scripted(behavior: AfterJoin) -> SharedClientFactory {
    Arc::new(move || -> Box<dyn ProtocolClient> {
        Box::new(ScriptedClient {
            behavior,
            joined: false,
            listeners: HashMap::new(),
        })
    })
}

/// Memory store whose `set_online(true)` takes longer than the connect ceiling.
struct SlowOnlineStore {
    inner: MemoryStateStore,
    delay: Duration,
}

#[async_trait]
impl StateStore for SlowOnlineStore {
    async fn set_online(&self, account_id: &AccountId, online: bool) -> StoreResult<()> {
        if online {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set_online(account_id, online).await
    }

    async fn save_chat(&self, event: &ChatEvent) -> StoreResult<()> {
        self.inner.save_chat(event).await
    }
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        connect_timeout: Duration::from_millis(300),
        stop_grace: Duration::from_millis(300),
        ..fast_config()
    }
}

fn target() -> ServerTarget {
    ServerTarget::new("127.0.0.1", 25565)
}

fn transitions(events: &[SessionEvent]) -> Vec<(SessionState, SessionState, Option<String>)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { from, to, detail } => Some((*from, *to, detail.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn no_join_within_ceiling_is_a_timeout() {
    let fleet = fleet_with(config(), scripted(AfterJoin::NeverJoin));
    let id = AccountId::new("acct1");

    let started = Instant::now();
    let result = fleet
        .supervisor
        .connect(Account::offline("acct1", "Alpha"), target(), quiet_settings())
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(
        result,
        Err(FleetError::Failed {
            reason: FailureReason::Timeout,
            ..
        })
    ));
    assert_eq!(fleet.store.online_history(&id), vec![false]);
    assert_eq!(fleet.supervisor.session_count().await, 0);
    assert!(
        elapsed < config().connect_failure_bound() + Duration::from_millis(400),
        "connect failure took {elapsed:?}"
    );

    let states: Vec<_> = transitions(&fleet.sink.events_for(&id))
        .into_iter()
        .map(|(from, to, _)| (from, to))
        .collect();
    assert_eq!(
        states,
        vec![
            (SessionState::Idle, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Joined),
            (SessionState::Joined, SessionState::Error(FailureReason::Timeout)),
            (SessionState::Error(FailureReason::Timeout), SessionState::Closed),
        ]
    );
}

#[tokio::test]
async fn stuck_worker_is_written_off_after_grace() {
    let fleet = fleet_with(config(), scripted(AfterJoin::Hang));
    let id = AccountId::new("acct1");

    fleet
        .supervisor
        .connect(Account::offline("acct1", "Alpha"), target(), quiet_settings())
        .await
        .unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(3), fleet.supervisor.disconnect(&id))
        .await
        .expect("disconnect must not wait on a stuck worker");
    assert!(stopped);
    assert_eq!(fleet.supervisor.session_count().await, 0);
    assert!(!fleet.supervisor.is_connected(&id).await);

    let last = transitions(&fleet.sink.events_for(&id)).pop().unwrap();
    assert_eq!(
        last,
        (
            SessionState::Disconnecting,
            SessionState::Closed,
            Some("leaked worker thread".to_string())
        )
    );
}

#[tokio::test]
async fn worker_panic_becomes_protocol_error() {
    let fleet = fleet_with(
        SupervisorConfig {
            connect_timeout: Duration::from_secs(2),
            ..config()
        },
        scripted(AfterJoin::Panic),
    );
    let id = AccountId::new("acct1");

    fleet
        .supervisor
        .connect(Account::offline("acct1", "Alpha"), target(), quiet_settings())
        .await
        .unwrap();

    let supervisor = &fleet.supervisor;
    eventually_async("panicked session reaped", || async move {
        supervisor.session_count().await == 0
    })
    .await;

    let states: Vec<_> = transitions(&fleet.sink.events_for(&id))
        .into_iter()
        .map(|(from, to, _)| (from, to))
        .collect();
    assert!(states.contains(&(
        SessionState::Active,
        SessionState::Error(FailureReason::ProtocolError)
    )));
    assert_eq!(fleet.store.online_history(&id), vec![true, false]);
}

#[tokio::test]
async fn late_activation_after_timeout_is_not_retried() {
    let store = Arc::new(SlowOnlineStore {
        inner: MemoryStateStore::new(),
        delay: Duration::from_millis(600),
    });
    let sink = Arc::new(MemoryEventSink::new());
    let supervisor = ConnectionSupervisor::new(
        config(),
        scripted(AfterJoin::Idle),
        store.clone(),
        sink.clone(),
    );
    let id = AccountId::new("acct1");
    let settings = ConnectionSettings {
        auto_reconnect_enabled: true,
        ..quiet_settings()
    };

    // The join lands, but `Active` is only published after the ceiling.
    let result = supervisor
        .connect(Account::offline("acct1", "Alpha"), target(), settings)
        .await;

    assert!(matches!(
        result,
        Err(FleetError::Failed {
            reason: FailureReason::Timeout,
            ..
        })
    ));
    assert_eq!(supervisor.session_count().await, 0);
    assert_eq!(store.inner.online_history(&id), vec![true, false]);

    assert!(
        transitions(&sink.events_for(&id))
            .iter()
            .any(|(from, to, _)| *from == SessionState::Active
                && *to == SessionState::Error(FailureReason::Timeout))
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!supervisor.has_pending_reconnect(&id));
    assert!(
        !sink
            .events_for(&id)
            .iter()
            .any(|event| matches!(event, SessionEvent::ReconnectScheduled { .. }))
    );
}
