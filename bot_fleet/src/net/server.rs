//! A small loopback game server speaking the bot protocol.
//!
//! Runs a single `mio` event loop on its own thread. It accepts logins,
//! pings joined players with keepalives, rebroadcasts chat and can be told
//! to kick players or move them between worlds through a [`ServerHandle`].
//! Good enough for dry runs and for exercising sessions end to end.

use mio::{
    Events, Interest, Poll, Token, Waker,
    net::{TcpListener, TcpStream},
};
use std::{
    collections::{HashMap, HashSet},
    io::{self, Read},
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::{Duration, Instant},
};
use uuid::Uuid;

use super::{
    messages::{ClientboundPacket, ServerboundPacket},
    protocol_version::ProtocolVersion,
    utils::{self, FrameBuffer},
};
use crate::account::ServerTarget;

const SERVER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const READ_CHUNK: usize = 8 * 1024;

/// Loopback server behavior.
#[derive(Clone, Debug)]
pub struct GameServerConfig {
    /// How often joined players receive a keepalive.
    pub keepalive_interval: Duration,
    /// World players join into.
    pub spawn_dimension: String,
    /// Version the server speaks.
    pub version: ProtocolVersion,
}

impl Default for GameServerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            spawn_dimension: "minecraft:overworld".to_string(),
            version: ProtocolVersion::current(),
        }
    }
}

/// A packet the server received from a logged-in player.
#[derive(Clone, Debug, PartialEq)]
pub struct Received {
    pub username: String,
    pub packet: ServerboundPacket,
    pub at: Instant,
}

#[derive(Debug)]
enum ServerCommand {
    Kick { username: String, reason: String },
    ChangeWorld { username: String, dimension: String },
    SendTo { username: String, packet: ClientboundPacket },
    Broadcast { text: String },
    Reject { username: String, reason: String },
    Shutdown,
}

#[derive(Default)]
struct Shared {
    received: Vec<Received>,
    online: HashSet<String>,
}

struct Connection {
    stream: TcpStream,
    buffer: FrameBuffer,
    username: Option<String>,
}

/// Entry point for starting a loopback server.
pub struct GameServer;

impl GameServer {
    /// Bind to `addr` and run the event loop on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket can't be bound or the poller can't be created.
    pub fn bind(addr: SocketAddr, config: GameServerConfig) -> io::Result<ServerHandle> {
        let mut listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, SERVER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (commands, inbox) = mpsc::channel();
        let shared = Arc::new(Mutex::new(Shared::default()));

        let event_loop = EventLoop {
            poll,
            listener,
            inbox,
            config,
            shared: shared.clone(),
            connections: HashMap::new(),
            rejected: HashMap::new(),
            next_token: FIRST_CONNECTION,
            next_keepalive_id: 1,
        };
        let thread = thread::Builder::new()
            .name("game-server".to_string())
            .spawn(move || {
                if let Err(error) = event_loop.run() {
                    log::error!("Game server loop failed: {error}");
                }
            })?;

        log::info!("Game server listening on {addr}");
        Ok(ServerHandle {
            addr,
            commands,
            waker,
            shared,
            thread: Some(thread),
        })
    }
}

/// Control handle for a running [`GameServer`]. Dropping it shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    commands: Sender<ServerCommand>,
    waker: Arc<Waker>,
    shared: Arc<Mutex<Shared>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn target(&self) -> ServerTarget {
        self.addr.into()
    }

    fn send(&self, command: ServerCommand) {
        if self.commands.send(command).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Send a disconnect to `username` and drop the connection.
    pub fn kick(&self, username: &str, reason: &str) {
        self.send(ServerCommand::Kick {
            username: username.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Move `username` to another world.
    pub fn change_world(&self, username: &str, dimension: &str) {
        self.send(ServerCommand::ChangeWorld {
            username: username.to_string(),
            dimension: dimension.to_string(),
        });
    }

    /// Send an arbitrary packet to `username`.
    pub fn send_to(&self, username: &str, packet: ClientboundPacket) {
        self.send(ServerCommand::SendTo {
            username: username.to_string(),
            packet,
        });
    }

    /// Server chat line to every joined player.
    pub fn broadcast(&self, text: &str) {
        self.send(ServerCommand::Broadcast {
            text: text.to_string(),
        });
    }

    /// Reject future logins from `username`.
    pub fn reject(&self, username: &str, reason: &str) {
        self.send(ServerCommand::Reject {
            username: username.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Snapshot of everything received from logged-in players.
    pub fn received(&self) -> Vec<Received> {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .received
            .clone()
    }

    /// Chat lines sent by `username`, in order.
    pub fn chat_from(&self, username: &str) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|r| r.username == username)
            .filter_map(|r| match r.packet {
                ServerboundPacket::Chat { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .online
            .contains(username)
    }

    pub fn online_count(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .online
            .len()
    }

    /// Stop the event loop and wait for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.send(ServerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    inbox: Receiver<ServerCommand>,
    config: GameServerConfig,
    shared: Arc<Mutex<Shared>>,
    connections: HashMap<Token, Connection>,
    rejected: HashMap<String, String>,
    next_token: usize,
    next_keepalive_id: u64,
}

impl EventLoop {
    fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        let mut next_keepalive = Instant::now() + self.config.keepalive_interval;

        loop {
            let timeout = next_keepalive.saturating_duration_since(Instant::now());
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }

            for event in &events {
                match event.token() {
                    SERVER => self.accept()?,
                    WAKER => {
                        if !self.drain_commands() {
                            self.close_all();
                            return Ok(());
                        }
                    }
                    token => self.read(token),
                }
            }

            if Instant::now() >= next_keepalive {
                self.ping_all();
                next_keepalive = Instant::now() + self.config.keepalive_interval;
            }
        }
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            buffer: FrameBuffer::new(),
                            username: None,
                        },
                    );
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    fn read(&mut self, token: Token) {
        let mut closed = false;
        let mut packets = Vec::new();
        if let Some(conn) = self.connections.get_mut(&token) {
            let mut chunk = [0; READ_CHUNK];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.buffer.push(&chunk[..n]),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
            loop {
                match conn.buffer.next_frame::<ServerboundPacket>() {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => break,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        for packet in packets {
            if !self.handle_packet(token, packet) {
                closed = true;
                break;
            }
        }
        if closed {
            self.close(token);
        }
    }

    /// Returns false when the connection should be closed.
    fn handle_packet(&mut self, token: Token, packet: ServerboundPacket) -> bool {
        let username = self
            .connections
            .get(&token)
            .and_then(|conn| conn.username.clone());

        match (username, packet) {
            (
                None,
                ServerboundPacket::Handshake {
                    version, username, ..
                },
            ) => self.login(token, version, username),
            (None, _) => false,
            (Some(_), ServerboundPacket::Handshake { .. }) => false,
            (Some(username), ServerboundPacket::Disconnect) => {
                self.record(&username, ServerboundPacket::Disconnect);
                false
            }
            (Some(username), ServerboundPacket::Chat { message }) => {
                self.record(
                    &username,
                    ServerboundPacket::Chat {
                        message: message.clone(),
                    },
                );
                if !message.starts_with('/') {
                    let json = serde_json::json!({ "text": format!("<{username}> {message}") });
                    self.broadcast(ClientboundPacket::Chat {
                        json: json.to_string(),
                    });
                }
                true
            }
            (Some(username), packet) => {
                self.record(&username, packet);
                true
            }
        }
    }

    fn login(&mut self, token: Token, version: ProtocolVersion, username: String) -> bool {
        let rejection = if !self.config.version.is_compatible_with(&version) {
            Some("Outdated client".to_string())
        } else if let Some(reason) = self.rejected.get(&username) {
            Some(reason.clone())
        } else if self.find(&username).is_some() {
            Some("You are already logged in".to_string())
        } else {
            None
        };

        if let Some(reason) = rejection {
            self.write(token, &ClientboundPacket::LoginRejected { reason });
            return false;
        }

        let entity_id = token.0 as i32;
        let ok = self.write(
            token,
            &ClientboundPacket::LoginSuccess {
                uuid: Uuid::new_v4().to_string(),
                username: username.clone(),
            },
        ) && self.write(
            token,
            &ClientboundPacket::JoinGame {
                entity_id,
                dimension: self.config.spawn_dimension.clone(),
            },
        );
        if !ok {
            return false;
        }

        log::info!("{username} joined the game server");
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.username = Some(username.clone());
        }
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .online
            .insert(username);
        true
    }

    fn record(&self, username: &str, packet: ServerboundPacket) {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .received
            .push(Received {
                username: username.to_string(),
                packet,
                at: Instant::now(),
            });
    }

    fn find(&self, username: &str) -> Option<Token> {
        self.connections
            .iter()
            .find(|(_, conn)| conn.username.as_deref() == Some(username))
            .map(|(token, _)| *token)
    }

    fn write(&mut self, token: Token, packet: &ClientboundPacket) -> bool {
        match self.connections.get_mut(&token) {
            Some(conn) => utils::write_prefixed(&mut conn.stream, packet).is_ok(),
            None => false,
        }
    }

    fn broadcast(&mut self, packet: ClientboundPacket) {
        let joined: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.username.is_some())
            .map(|(token, _)| *token)
            .collect();
        for token in joined {
            if !self.write(token, &packet) {
                self.close(token);
            }
        }
    }

    fn ping_all(&mut self) {
        let id = self.next_keepalive_id;
        self.next_keepalive_id += 1;
        self.broadcast(ClientboundPacket::KeepAlive { id });
    }

    /// Returns false on shutdown.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                ServerCommand::Kick { username, reason } => {
                    if let Some(token) = self.find(&username) {
                        self.write(token, &ClientboundPacket::Disconnect { reason });
                        self.close(token);
                    }
                }
                ServerCommand::ChangeWorld {
                    username,
                    dimension,
                } => {
                    if let Some(token) = self.find(&username) {
                        self.write(token, &ClientboundPacket::Respawn { dimension });
                    }
                }
                ServerCommand::SendTo { username, packet } => {
                    if let Some(token) = self.find(&username) {
                        self.write(token, &packet);
                    }
                }
                ServerCommand::Broadcast { text } => {
                    let json = serde_json::json!({ "text": text });
                    self.broadcast(ClientboundPacket::Chat {
                        json: json.to_string(),
                    });
                }
                ServerCommand::Reject { username, reason } => {
                    self.rejected.insert(username, reason);
                }
                ServerCommand::Shutdown => return false,
            }
        }
        true
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            if let Some(username) = conn.username {
                log::info!("{username} left the game server");
                self.shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .online
                    .remove(&username);
            }
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }
}
