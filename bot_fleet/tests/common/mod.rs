//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bot_fleet::{
    ConnectionSettings, ConnectionSupervisor, GameServer, GameServerConfig, MemoryEventSink,
    MemoryStateStore, ServerHandle, SharedClientFactory, SupervisorConfig, TcpProtocolClient,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

pub struct Fleet {
    pub supervisor: ConnectionSupervisor,
    pub store: Arc<MemoryStateStore>,
    pub sink: Arc<MemoryEventSink>,
}

/// Timings short enough for tests against the loopback server.
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        connect_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        anti_afk_period: Duration::from_millis(200),
        send_timeout: Duration::from_secs(2),
        ..SupervisorConfig::default()
    }
}

/// Settings with every optional behavior off.
pub fn quiet_settings() -> ConnectionSettings {
    ConnectionSettings {
        anti_afk_enabled: false,
        auto_reconnect_enabled: false,
        login_messages_enabled: false,
        world_change_messages_enabled: false,
        login_delay: Duration::from_millis(50),
        ..ConnectionSettings::default()
    }
}

pub fn fleet_with(config: SupervisorConfig, factory: SharedClientFactory) -> Fleet {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemoryEventSink::new());
    let supervisor = ConnectionSupervisor::new(config, factory, store.clone(), sink.clone());
    Fleet {
        supervisor,
        store,
        sink,
    }
}

pub fn fleet() -> Fleet {
    let config = fast_config();
    let factory = TcpProtocolClient::factory(config.poll_interval);
    fleet_with(config, factory)
}

pub fn game_server() -> ServerHandle {
    GameServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        GameServerConfig {
            keepalive_interval: Duration::from_millis(100),
            ..GameServerConfig::default()
        },
    )
    .unwrap()
}

/// Poll `condition` for up to five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// [`eventually`] for conditions that need to await.
pub async fn eventually_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
