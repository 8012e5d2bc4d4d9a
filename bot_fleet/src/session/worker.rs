//! The blocking side of a session.
//!
//! One OS thread per session owns the [`ProtocolClient`]. It connects,
//! registers listeners, then alternates between draining its command queue
//! and polling the socket. Everything it learns goes out through the bridge.

use std::{
    io,
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    time::Duration,
};

use super::bridge::{BridgeEvent, BridgeSender, WorkerCommand};
use crate::{
    account::{AccountId, ServerTarget},
    net::{
        messages::{ClientboundPacket, PacketKind, ServerboundPacket, chat_text},
        protocol::ProtocolClient,
    },
};

/// What a worker thread needs to run one connection attempt.
pub struct WorkerContext {
    pub account_id: AccountId,
    pub target: ServerTarget,
    pub username: String,
    pub online_mode: bool,
    pub connect_timeout: Duration,
    pub client: Box<dyn ProtocolClient>,
    pub bridge: BridgeSender,
    pub commands: Receiver<WorkerCommand>,
}

/// Name given to the worker thread of `account_id`.
pub fn thread_name(account_id: &AccountId) -> String {
    format!("bot-worker-{account_id}")
}

/// Spawn the worker thread. The bridge closes when the thread exits.
pub fn spawn(context: WorkerContext) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(thread_name(&context.account_id))
        .spawn(move || run(context))
}

fn run(context: WorkerContext) {
    let WorkerContext {
        account_id,
        target,
        username,
        online_mode,
        connect_timeout,
        mut client,
        bridge,
        commands,
    } = context;

    log::debug!("{account_id}: connecting to {target} as {username}");
    if let Err(error) = client.connect(&target, &username, online_mode, connect_timeout) {
        log::info!("{account_id}: connect to {target} failed: {error}");
        let _ = bridge.send(BridgeEvent::ConnectFailed {
            reason: error.reason(),
            detail: error.to_string(),
        });
        return;
    }

    register_listeners(client.as_mut(), &account_id, &bridge);
    if bridge.send(BridgeEvent::Connected).is_err() {
        // The pump gave up on us while we were connecting.
        client.disconnect();
        return;
    }

    loop {
        if !drain_commands(client.as_mut(), &account_id, &bridge, &commands) {
            client.disconnect();
            log::debug!("{account_id}: worker stopped");
            return;
        }

        if let Err(error) = client.poll() {
            log::info!("{account_id}: connection lost: {error}");
            let _ = bridge.send(BridgeEvent::ConnectionLost {
                reason: error.reason(),
                detail: error.to_string(),
            });
            client.disconnect();
            return;
        }

        // A disconnect packet was dispatched; its listener already reported it.
        if !client.is_connected() {
            log::debug!("{account_id}: server closed the session");
            return;
        }
    }
}

/// Service queued commands. Returns `false` once the worker should exit.
fn drain_commands(
    client: &mut dyn ProtocolClient,
    account_id: &AccountId,
    bridge: &BridgeSender,
    commands: &Receiver<WorkerCommand>,
) -> bool {
    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Write(packet, ack)) => {
                let result = client.write_packet(&packet);
                match (&result, &packet) {
                    (Ok(()), ServerboundPacket::Chat { message }) => {
                        let _ = bridge.send(BridgeEvent::ChatSent {
                            text: message.clone(),
                        });
                    }
                    (Err(error), _) => log::warn!("{account_id}: write failed: {error}"),
                    _ => {}
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result.map_err(|error| error.to_string()));
                }
            }
            Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected) => return false,
            Err(TryRecvError::Empty) => return true,
        }
    }
}

fn register_listeners(
    client: &mut dyn ProtocolClient,
    account_id: &AccountId,
    bridge: &BridgeSender,
) {
    // Keepalives are answered on this thread, never through the bridge.
    let id = account_id.clone();
    client.register_listener(
        PacketKind::KeepAlive,
        Box::new(move |packet, writer| {
            if let ClientboundPacket::KeepAlive { id: ping } = packet {
                if let Err(error) = writer.write_packet(&ServerboundPacket::KeepAlive { id: *ping }) {
                    log::warn!("{id}: keepalive echo failed: {error}");
                }
            }
        }),
    );

    let tx = bridge.clone();
    client.register_listener(
        PacketKind::JoinGame,
        Box::new(move |packet, _| {
            if let ClientboundPacket::JoinGame { dimension, .. } = packet {
                let _ = tx.send(BridgeEvent::JoinedGame {
                    dimension: dimension.clone(),
                });
            }
        }),
    );

    let tx = bridge.clone();
    client.register_listener(
        PacketKind::Respawn,
        Box::new(move |packet, _| {
            if let ClientboundPacket::Respawn { dimension } = packet {
                let _ = tx.send(BridgeEvent::WorldChanged {
                    dimension: dimension.clone(),
                });
            }
        }),
    );

    let tx = bridge.clone();
    client.register_listener(
        PacketKind::Chat,
        Box::new(move |packet, _| {
            if let ClientboundPacket::Chat { json } = packet {
                let _ = tx.send(BridgeEvent::Chat {
                    text: chat_text(json),
                });
            }
        }),
    );

    let tx = bridge.clone();
    client.register_listener(
        PacketKind::Disconnect,
        Box::new(move |packet, _| {
            if let ClientboundPacket::Disconnect { reason } = packet {
                let _ = tx.send(BridgeEvent::Disconnected {
                    reason: reason.clone(),
                });
            }
        }),
    );
}
