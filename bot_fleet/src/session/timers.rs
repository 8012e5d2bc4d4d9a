//! Timed behaviour that runs only while a session is `Active`.
//!
//! Every task checks the session state before it acts and the pump aborts
//! all of them on leaving `Active`, before it persists anything.

use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep},
};

use super::{SessionStatus, bridge::CommandSender};
use crate::{
    account::{AccountId, ConnectionSettings, ScriptEntry},
    net::messages::ServerboundPacket,
};

/// Y coordinate the anti-afk step is taken at.
const ANTI_AFK_FEET_Y: f64 = 64.0;

/// Everything a timer task needs. Cloned into each task.
#[derive(Clone)]
pub struct TimerContext {
    pub account_id: AccountId,
    pub settings: Arc<ConnectionSettings>,
    pub commands: CommandSender,
    pub status: watch::Receiver<SessionStatus>,
    pub anti_afk_period: Duration,
}

impl TimerContext {
    fn is_active(&self) -> bool {
        self.status.borrow().state.is_active()
    }
}

/// Handles to the running timer tasks of one session.
#[derive(Default)]
pub struct Timers {
    anti_afk: Option<JoinHandle<()>>,
    login_script: Option<JoinHandle<()>>,
    world_change_script: Option<JoinHandle<()>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start everything enabled for a fresh `Active` entry.
    pub fn on_active(&mut self, context: &TimerContext) {
        self.stop_all();
        if context.settings.anti_afk_enabled {
            self.anti_afk = Some(tokio::spawn(anti_afk(context.clone())));
        }
        if let Some(script) = context.settings.login_script() {
            self.login_script = Some(tokio::spawn(run_script(
                context.clone(),
                script.to_vec(),
                "login",
            )));
        }
    }

    /// Restart the world-change script. A run still in progress is dropped.
    pub fn on_world_change(&mut self, context: &TimerContext) {
        if let Some(handle) = self.world_change_script.take() {
            handle.abort();
        }
        if let Some(script) = context.settings.world_change_script() {
            self.world_change_script = Some(tokio::spawn(run_script(
                context.clone(),
                script.to_vec(),
                "world change",
            )));
        }
    }

    /// Abort every task. Aborted tasks are never polled again.
    pub fn stop_all(&mut self) {
        for handle in [
            self.anti_afk.take(),
            self.login_script.take(),
            self.world_change_script.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    pub fn running(&self) -> usize {
        [&self.anti_afk, &self.login_script, &self.world_change_script]
            .into_iter()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// A small step around the spawn column.
fn anti_afk_step() -> ServerboundPacket {
    ServerboundPacket::PlayerPosition {
        x: rand::random_range(-0.5..0.5),
        y: ANTI_AFK_FEET_Y,
        z: rand::random_range(-0.5..0.5),
        on_ground: true,
    }
}

/// One movement per period, the first one a full period after `Active`.
async fn anti_afk(context: TimerContext) {
    let period = context.anti_afk_period;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !context.is_active() {
            return;
        }
        if !context.commands.write(anti_afk_step()) {
            return;
        }
        log::debug!("{}: anti-afk movement sent", context.account_id);
    }
}

/// Send `script` line by line. The first line waits the login settle delay,
/// later lines wait their own delay.
async fn run_script(context: TimerContext, script: Vec<ScriptEntry>, label: &'static str) {
    let account_id = &context.account_id;
    for (index, entry) in script.iter().enumerate() {
        let delay = if index == 0 {
            context.settings.login_delay
        } else {
            entry.delay
        };
        sleep(delay).await;
        if !context.is_active() {
            return;
        }
        let packet = ServerboundPacket::Chat {
            message: entry.text.clone(),
        };
        if let Err(error) = context.commands.write_confirmed(packet).await {
            log::warn!("{account_id}: {label} script stopped: {error}");
            return;
        }
        log::debug!("{account_id}: {label} message {} sent", index + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        SessionState,
        bridge::{WorkerCommand, command_queue},
    };
    use std::sync::mpsc::Receiver;

    fn context(settings: ConnectionSettings) -> (
        TimerContext,
        watch::Sender<SessionStatus>,
        Receiver<WorkerCommand>,
    ) {
        let (commands, receiver) = command_queue();
        let (status_tx, status) = watch::channel(SessionStatus::new(SessionState::Active));
        let context = TimerContext {
            account_id: AccountId::new("acct1"),
            settings: Arc::new(settings),
            commands,
            status,
            anti_afk_period: Duration::from_secs(60),
        };
        (context, status_tx, receiver)
    }

    /// Count queued writes, acknowledging any that wait for it.
    fn drain(receiver: &Receiver<WorkerCommand>) -> Vec<ServerboundPacket> {
        let mut packets = Vec::new();
        while let Ok(command) = receiver.try_recv() {
            if let WorkerCommand::Write(packet, ack) = command {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                packets.push(packet);
            }
        }
        packets
    }

    fn anti_afk_only() -> ConnectionSettings {
        ConnectionSettings {
            anti_afk_enabled: true,
            login_messages_enabled: false,
            ..ConnectionSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn anti_afk_fires_once_per_period() {
        let (context, _status, receiver) = context(anti_afk_only());
        let mut timers = Timers::new();
        timers.on_active(&context);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(drain(&receiver).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&receiver).len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let packets = drain(&receiver);
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            packets[0],
            ServerboundPacket::PlayerPosition { on_ground: true, .. }
        ));
        timers.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_stop_mid_window() {
        let (context, status, receiver) = context(anti_afk_only());
        let mut timers = Timers::new();
        timers.on_active(&context);

        tokio::time::sleep(Duration::from_secs(30)).await;
        status.send_modify(|status| status.state = SessionState::Disconnecting);
        timers.stop_all();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(drain(&receiver).is_empty());
        assert_eq!(timers.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_blocks_a_tick_after_leaving_active() {
        let (context, status, receiver) = context(anti_afk_only());
        let mut timers = Timers::new();
        timers.on_active(&context);

        // State moved on but the task was not aborted: the gate alone holds.
        status.send_modify(|status| status.state = SessionState::Error(
            crate::errors::FailureReason::ProtocolError,
        ));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(drain(&receiver).is_empty());
        assert_eq!(timers.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn login_script_waits_settle_delay_then_per_line_delay() {
        let settings = ConnectionSettings {
            anti_afk_enabled: false,
            login_messages_enabled: true,
            login_delay: Duration::from_secs(3),
            login_messages: vec![
                ScriptEntry::new("/login secret"),
                ScriptEntry::new("hello").with_delay(Duration::from_secs(5)),
            ],
            ..ConnectionSettings::default()
        };
        let (context, _status, receiver) = context(settings);
        let mut timers = Timers::new();
        timers.on_active(&context);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(drain(&receiver).is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            drain(&receiver),
            vec![ServerboundPacket::Chat {
                message: "/login secret".to_string()
            }]
        );

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(drain(&receiver).is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            drain(&receiver),
            vec![ServerboundPacket::Chat {
                message: "hello".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn world_change_restarts_script() {
        let settings = ConnectionSettings {
            anti_afk_enabled: false,
            login_messages_enabled: false,
            world_change_messages_enabled: true,
            login_delay: Duration::from_secs(3),
            world_change_messages: vec![ScriptEntry::new("/spawn")],
            ..ConnectionSettings::default()
        };
        let (context, _status, receiver) = context(settings);
        let mut timers = Timers::new();
        timers.on_active(&context);
        assert_eq!(timers.running(), 0);

        timers.on_world_change(&context);
        tokio::time::sleep(Duration::from_secs(2)).await;
        // A second change before the first run finished replaces it.
        timers.on_world_change(&context);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(drain(&receiver).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&receiver).len(), 1);

        timers.on_world_change(&context);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(drain(&receiver).len(), 1);
    }
}
