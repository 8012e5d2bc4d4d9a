//! Bot fleet daemon.
//!
//! Connects every configured account through a `ConnectionSupervisor`,
//! relays session notifications to the log and disconnects the fleet on
//! Ctrl+C.

mod config;
mod logging;

use std::{sync::Arc, time::Duration};

use anyhow::Error;
use bot_fleet::{
    ConnectionSupervisor, EventSink, GameServer, GameServerConfig, MemoryStateStore, ServerHandle,
    StateStore, SubscriberSink, TcpProtocolClient, db::Database,
};
use ctrlc::set_handler;
use log::{error, info, warn};
use pico_args::Arguments;
use tokio::{sync::watch, task::JoinSet};

use config::{FleetConfig, Overrides};

const HELP: &str = "\
Keep a fleet of bot accounts connected to a game server

USAGE:
  bf_server [OPTIONS]

OPTIONS:
  --server     HOST[:PORT]   Game server to join          [default: env BOT_SERVER]
  --accounts   LIST          id=name pairs, comma separated [default: env BOT_ACCOUNTS]
  --db-url     URL           Database connection string   [default: env DATABASE_URL, in-memory if unset]

FLAGS:
  --loopback                 Join an in-process loopback server instead
  -h, --help                 Print help information

ENVIRONMENT:
  BOT_ACCOUNT_KIND           offline or authenticated     [default: offline]
  CONNECT_TIMEOUT_SECS       Bound on reaching Active     [default: 30]
  STOP_GRACE_SECS            Bound on worker shutdown     [default: 5]
  ANTI_AFK_ENABLED           Periodic position updates    [default: true]
  AUTO_RECONNECT_ENABLED     Retry after unexpected drops [default: true]
  LOGIN_DELAY_SECS           Settle delay before scripts  [default: 3]
  LOGIN_MESSAGES             ';'-separated lines, optional '@SECS' delay suffix
  WORLD_CHANGE_MESSAGES      Same format, sent after each world change
  (See .env file for all configuration options)
";

/// Notifications buffered for the log relay before the sink starts dropping.
const RELAY_CAPACITY: usize = 1024;

const RELAY_DRAIN: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let overrides = Overrides {
        server: pargs.opt_value_from_str("--server")?,
        accounts: pargs.opt_value_from_str("--accounts")?,
        database_url: pargs.opt_value_from_str("--db-url")?,
        loopback: pargs.contains("--loopback"),
    };

    logging::init();

    let config = FleetConfig::from_env(overrides)?;
    config.validate()?;

    // Catching signals for a graceful disconnect.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    let (store, database): (Arc<dyn StateStore>, Option<Database>) = match &config.database {
        Some(db_config) => {
            info!("Connecting to database");
            let db = Database::new(db_config)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
            db.health_check()
                .await
                .map_err(|e| anyhow::anyhow!("Database health check failed: {}", e))?;
            info!("Database connected successfully");
            (Arc::new(db.state_store()), Some(db))
        }
        None => {
            warn!("DATABASE_URL not set, account status is kept in memory only");
            (Arc::new(MemoryStateStore::new()), None)
        }
    };

    let sink = Arc::new(SubscriberSink::new());
    let mut notifications = sink.subscribe(RELAY_CAPACITY);
    let relay = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            logging::log_session_event(&notification);
        }
    });

    let loopback: Option<ServerHandle> = if config.loopback {
        let handle = GameServer::bind(([127, 0, 0, 1], 0).into(), GameServerConfig::default())?;
        info!("Loopback game server listening on {}", handle.addr());
        Some(handle)
    } else {
        None
    };
    let target = match (&loopback, &config.server) {
        (Some(handle), _) => handle.target(),
        (None, Some(server)) => server.clone(),
        (None, None) => anyhow::bail!("no game server configured"),
    };

    let supervisor = ConnectionSupervisor::new(
        config.supervisor.clone(),
        TcpProtocolClient::factory(config.supervisor.poll_interval),
        store,
        sink.clone() as Arc<dyn EventSink>,
    );

    info!("Connecting {} account(s) to {}", config.accounts.len(), target);
    let mut connects = JoinSet::new();
    for account in config.accounts.iter().cloned() {
        let supervisor = supervisor.clone();
        let target = target.clone();
        let settings = config.settings.clone();
        connects.spawn(async move {
            let id = account.id.clone();
            (id, supervisor.connect(account, target, settings).await)
        });
    }
    while let Some(joined) = connects.join_next().await {
        match joined {
            Ok((id, Ok(()))) => info!("✓ {id} is online"),
            Ok((id, Err(e))) => {
                error!("{id}: {}", e.client_message());
                log::debug!("{id}: {e}");
            }
            Err(e) => error!("Connect task failed: {e}"),
        }
    }

    let connected = supervisor.list_connected().await;
    info!(
        "Fleet ready with {}/{} account(s) online. Press Ctrl+C to stop.",
        connected.len(),
        config.accounts.len()
    );

    let _ = shutdown_rx.wait_for(|stop| *stop).await;

    info!("Shutting down fleet...");
    let stopped = supervisor.disconnect_all().await;
    info!("Disconnected {stopped} session(s)");

    // Pumps hold the sink until they finish; give the relay a moment to drain.
    drop(supervisor);
    drop(sink);
    if tokio::time::timeout(RELAY_DRAIN, relay).await.is_err() {
        log::debug!("Log relay still running at exit");
    }

    if let Some(handle) = loopback {
        handle.shutdown();
    }
    if let Some(db) = database {
        db.close().await;
    }

    Ok(())
}
