//! # Bot Fleet
//!
//! Keeps many bot accounts connected to a game server, each in its own
//! session, and lets a control plane connect, disconnect and speak through
//! them.
//!
//! ## Architecture
//!
//! Every connection attempt is a [`session::BotSession`] that moves through
//! a fixed lifecycle:
//!
//! - **Idle**: created, nothing started
//! - **Connecting**: worker thread is in the blocking login
//! - **Joined**: login done, waiting for the world join
//! - **Active**: in game; anti-afk and chat scripts may run
//! - **Disconnecting / Error**: stopping, by request or by failure
//! - **Closed**: worker thread gone, session no longer addressable
//!
//! Blocking socket I/O happens on one OS thread per session. The thread
//! reports through an ordered channel to a per-session pump task, which is
//! the only place state changes, persistence and notifications happen.
//!
//! ## Core Modules
//!
//! - [`supervisor`]: one session per account, connect/disconnect/send
//! - [`session`]: state machine, worker thread, pump and timers
//! - [`reconnect`]: retry schedule after an unexpected disconnect
//! - [`net`]: protocol client trait, TCP client and loopback server
//! - [`store`]: persistence and notification seams
//! - [`db`]: PostgreSQL pool and store
//!
//! ## Example
//!
//! ```no_run
//! use bot_fleet::{
//!     Account, ConnectionSettings, ConnectionSupervisor, MemoryEventSink, MemoryStateStore,
//!     ServerTarget, SupervisorConfig, TcpProtocolClient,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SupervisorConfig::default();
//!     let supervisor = ConnectionSupervisor::new(
//!         config.clone(),
//!         TcpProtocolClient::factory(config.poll_interval),
//!         Arc::new(MemoryStateStore::new()),
//!         Arc::new(MemoryEventSink::new()),
//!     );
//!     let account = Account::offline("acct1", "Steve");
//!     let target: ServerTarget = "localhost:25565".parse().unwrap();
//!     match supervisor.connect(account, target, ConnectionSettings::default()).await {
//!         Ok(()) => println!("connected"),
//!         Err(error) => println!("{}", error.client_message()),
//!     }
//! }
//! ```

pub mod account;
pub use account::{
    Account, AccountId, AccountKind, ChatDirection, ChatEvent, ConnectionSettings, ScriptEntry,
    ServerTarget,
};

pub mod config;
pub use config::SupervisorConfig;

/// PostgreSQL connection pool and state store.
pub mod db;

pub mod errors;
pub use errors::{FailureReason, FleetError, FleetResult};

/// Networking components for bot-to-server communication.
pub mod net;
pub use net::{
    client::TcpProtocolClient,
    protocol::{ClientFactory, ProtocolClient, ProtocolError, SharedClientFactory},
    server::{GameServer, GameServerConfig, ServerHandle},
};

pub mod reconnect;
pub use reconnect::ReconnectPolicy;

pub mod session;
pub use session::{BotSession, SessionState};

/// Persistence and notification seams.
pub mod store;
pub use store::{
    EventSink, MemoryEventSink, MemoryStateStore, SessionEvent, StateStore, SubscriberSink,
};

pub mod supervisor;
pub use supervisor::ConnectionSupervisor;
