// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    PacketId, PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::commands::{AckResponder, Qos2Cmd};
use crate::error::{Error, ErrorKind};
use crate::status::{ConnectionStatus, StatusCell};

/// Outbound exactly-once delivery going through
/// `AwaitingPubRec → AwaitingPubComp → Done`.
struct PendingPublish {
    packet: PublishPacket,
    waiter: AckResponder<()>,
    deadline: Instant,
    retries_left: u32,

    /// False while waiting for PUBREC, true while waiting for PUBCOMP.
    /// Decides what a retry resends.
    pubrec_seen: bool,
}

/// Exactly-once retry state machine for outbound publishes.
pub struct Qos2Engine {
    cmd_rx: mpsc::Receiver<Qos2Cmd>,
    outbound_tx: mpsc::Sender<codec::MqttPacket>,
    status: Arc<StatusCell>,
    retry_interval: Duration,
    max_retries: u32,
    pending: HashMap<PacketId, PendingPublish>,
}

impl Qos2Engine {
    pub fn spawn(
        cmd_rx: mpsc::Receiver<Qos2Cmd>,
        outbound_tx: mpsc::Sender<codec::MqttPacket>,
        status: Arc<StatusCell>,
        retry_interval: Duration,
        max_retries: u32,
    ) -> JoinHandle<()> {
        let engine = Self {
            cmd_rx,
            outbound_tx,
            status,
            retry_interval,
            max_retries,
            pending: HashMap::new(),
        };
        tokio::spawn(engine.run())
    }

    async fn run(mut self) {
        let mut tick = interval(super::tick_period(self.retry_interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.cmd_rx.recv() => match maybe {
                    Some(Qos2Cmd::Publish { packet, waiter }) => {
                        self.on_submit(packet, waiter).await;
                    }
                    Some(Qos2Cmd::Received(rec)) => self.on_received(&rec).await,
                    Some(Qos2Cmd::Complete(comp)) => self.on_complete(&comp),
                    Some(Qos2Cmd::Halt) | None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        for (_id, entry) in self.pending.drain() {
            let _ = entry
                .waiter
                .send(Err(Error::new(ErrorKind::Cancelled, "Session terminated")));
        }
    }

    async fn on_submit(&mut self, packet: PublishPacket, waiter: AckResponder<()>) {
        let packet_id = packet.packet_id();
        if self.pending.contains_key(&packet_id) {
            let _ = waiter.send(Err(Error::from_string(
                ErrorKind::PidError,
                format!("Packet id {packet_id} already in flight"),
            )));
            return;
        }

        if self.outbound_tx.send(packet.clone().into()).await.is_err() {
            let _ = waiter.send(Err(Error::new(
                ErrorKind::ChannelError,
                "Outbound queue is gone",
            )));
            return;
        }

        self.pending.insert(
            packet_id,
            PendingPublish {
                packet,
                waiter,
                deadline: Instant::now() + self.retry_interval,
                retries_left: self.max_retries,
                pubrec_seen: false,
            },
        );
    }

    /// PUBREC moves the delivery to the second half of the handshake. A
    /// repeated PUBREC gets a repeated PUBREL; a PUBREC with no pending
    /// entry still gets a PUBREL so the server can clean up.
    async fn on_received(&mut self, rec: &PublishReceivedPacket) {
        let packet_id = rec.packet_id();
        match self.pending.get_mut(&packet_id) {
            Some(entry) => {
                entry.pubrec_seen = true;
                entry.deadline = Instant::now() + self.retry_interval;
            }
            None => {
                log::warn!("qos2: unsolicited pubrec for {packet_id}, releasing anyway");
            }
        }
        let _ = self
            .outbound_tx
            .send(PublishReleasePacket::new(packet_id).into())
            .await;
    }

    fn on_complete(&mut self, comp: &PublishCompletePacket) {
        let packet_id = comp.packet_id();
        match self.pending.remove(&packet_id) {
            Some(entry) => {
                let _ = entry.waiter.send(Ok(()));
            }
            None => log::warn!("qos2: unsolicited pubcomp for {packet_id}"),
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        // Deadlines freeze while no connection is up, mirroring the QoS 1
        // engine.
        let connected = self.status.get() == ConnectionStatus::Connected;
        let ids: Vec<PacketId> = self.pending.keys().copied().collect();

        for packet_id in ids {
            let Some(entry) = self.pending.get_mut(&packet_id) else {
                continue;
            };

            if entry.waiter.is_closed() {
                self.pending.remove(&packet_id);
                continue;
            }
            if !connected || entry.deadline > now {
                continue;
            }

            if entry.retries_left > 0 {
                entry.retries_left -= 1;
                entry.deadline = now + self.retry_interval;
                let resend: codec::MqttPacket = if entry.pubrec_seen {
                    PublishReleasePacket::new(packet_id).into()
                } else {
                    entry.packet.dup_copy().into()
                };
                log::debug!(
                    "qos2: retransmit {packet_id} (pubrec_seen: {}), {} retries left",
                    entry.pubrec_seen,
                    entry.retries_left
                );
                let _ = self.outbound_tx.send(resend).await;
            } else if let Some(entry) = self.pending.remove(&packet_id) {
                let _ = entry.waiter.send(Err(Error::from_string(
                    ErrorKind::Timeout,
                    format!("QoS 2 handshake for {packet_id} never completed"),
                )));
            }
        }
    }
}
