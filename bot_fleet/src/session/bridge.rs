//! Messages crossing between a session's worker thread and the control plane.
//!
//! Two one-way queues per session:
//! - the bridge (worker -> pump): a tokio unbounded channel, so the worker
//!   never blocks and the pump can await it
//! - the command queue (control plane -> worker): a std channel the worker
//!   drains between socket polls

use std::sync::mpsc as std_mpsc;
use tokio::sync::{mpsc, oneshot};

use crate::{errors::FailureReason, net::messages::ServerboundPacket};

/// Everything a worker thread reports. The worker never touches shared
/// state; it only enqueues one of these.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    /// Login completed and listeners are registered.
    Connected,
    /// The blocking connect call failed.
    ConnectFailed {
        reason: FailureReason,
        detail: String,
    },
    /// The server placed the player in a world.
    JoinedGame { dimension: String },
    /// The player was moved to another world.
    WorldChanged { dimension: String },
    /// Decoded inbound chat line.
    Chat { text: String },
    /// An outbound chat line reached the socket.
    ChatSent { text: String },
    /// The server closed the session with a disconnect packet.
    Disconnected { reason: String },
    /// The socket failed mid-session.
    ConnectionLost {
        reason: FailureReason,
        detail: String,
    },
}

pub type BridgeSender = mpsc::UnboundedSender<BridgeEvent>;
pub type BridgeReceiver = mpsc::UnboundedReceiver<BridgeEvent>;

/// Create the bridge for one session.
pub fn channel() -> (BridgeSender, BridgeReceiver) {
    mpsc::unbounded_channel()
}

/// Outcome of a write, reported back to whoever asked for it.
pub type WriteAck = oneshot::Sender<Result<(), String>>;

/// Requests the worker services between polls.
#[derive(Debug)]
pub enum WorkerCommand {
    Write(ServerboundPacket, Option<WriteAck>),
    Stop,
}

/// Control-plane end of a worker's command queue.
///
/// Cheap to clone; timers and the supervisor each hold one.
#[derive(Clone, Debug)]
pub struct CommandSender(std_mpsc::Sender<WorkerCommand>);

impl CommandSender {
    pub fn new(sender: std_mpsc::Sender<WorkerCommand>) -> Self {
        Self(sender)
    }

    /// Queue a packet without waiting for the result.
    ///
    /// Returns `false` when the worker has already exited.
    pub fn write(&self, packet: ServerboundPacket) -> bool {
        self.0.send(WorkerCommand::Write(packet, None)).is_ok()
    }

    /// Queue a packet and wait until the worker has written it.
    pub async fn write_confirmed(&self, packet: ServerboundPacket) -> Result<(), String> {
        let (ack, done) = oneshot::channel();
        self.0
            .send(WorkerCommand::Write(packet, Some(ack)))
            .map_err(|_| "worker has exited".to_string())?;
        done.await
            .map_err(|_| "worker exited before writing".to_string())?
    }

    pub fn stop(&self) {
        let _ = self.0.send(WorkerCommand::Stop);
    }
}

/// Create the command queue for one session.
pub fn command_queue() -> (CommandSender, std_mpsc::Receiver<WorkerCommand>) {
    let (sender, receiver) = std_mpsc::channel();
    (CommandSender::new(sender), receiver)
}
