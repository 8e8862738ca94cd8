// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::PingRequestPacket;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::commands::{HeartbeatCmd, SessionEvent};

/// Keep-alive scheduler and silence detector.
///
/// While a connection is up, a PINGREQ goes out every quarter of the
/// keep-alive window. If the server has not answered anything for a full
/// window, a single `KeepAliveTimeout` event fires; the supervisor turns
/// it into a server-disconnect.
///
/// A zero keep-alive disables probing entirely.
pub struct Heartbeat {
    cmd_rx: mpsc::Receiver<HeartbeatCmd>,
    outbound_tx: mpsc::Sender<codec::MqttPacket>,
    events_tx: mpsc::Sender<SessionEvent>,
    keep_alive: Duration,

    /// When the server was last heard from.
    last_response: Instant,

    /// Probing is active only between `Activate` and `Suspend`.
    active: bool,
}

impl Heartbeat {
    pub fn spawn(
        cmd_rx: mpsc::Receiver<HeartbeatCmd>,
        outbound_tx: mpsc::Sender<codec::MqttPacket>,
        events_tx: mpsc::Sender<SessionEvent>,
        keep_alive: Duration,
    ) -> JoinHandle<()> {
        let heartbeat = Self {
            cmd_rx,
            outbound_tx,
            events_tx,
            keep_alive,
            last_response: Instant::now(),
            active: false,
        };
        tokio::spawn(heartbeat.run())
    }

    async fn run(mut self) {
        if self.keep_alive.is_zero() {
            // Keep-alive disabled: only consume commands.
            while let Some(cmd) = self.cmd_rx.recv().await {
                if matches!(cmd, HeartbeatCmd::Halt) {
                    break;
                }
            }
            return;
        }

        let probe_period = self.keep_alive / 4;
        let mut tick = interval(probe_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.cmd_rx.recv() => match maybe {
                    Some(HeartbeatCmd::Activate) => {
                        self.active = true;
                        self.last_response = Instant::now();
                        // Probe right away so a mute server is detected
                        // within one window even on an idle connection.
                        self.send_ping().await;
                    }
                    Some(HeartbeatCmd::Suspend) => self.active = false,
                    Some(HeartbeatCmd::PingResponse) => {
                        self.last_response = Instant::now();
                    }
                    Some(HeartbeatCmd::Halt) | None => break,
                },
                _ = tick.tick(), if self.active => {
                    if self.last_response.elapsed() > self.keep_alive {
                        log::warn!(
                            "heartbeat: no response for {:?}, declaring the server gone",
                            self.last_response.elapsed()
                        );
                        // Single shot: stay quiet until the next Activate.
                        self.active = false;
                        let _ = self.events_tx.send(SessionEvent::KeepAliveTimeout).await;
                    } else {
                        self.send_ping().await;
                    }
                },
            }
        }
    }

    async fn send_ping(&self) {
        let _ = self
            .outbound_tx
            .send(PingRequestPacket::new().into())
            .await;
    }
}
