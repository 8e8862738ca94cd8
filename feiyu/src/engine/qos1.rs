// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{PacketId, PublishAckPacket, PublishPacket};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::commands::{AckResponder, Qos1Cmd};
use crate::error::{Error, ErrorKind};
use crate::status::{ConnectionStatus, StatusCell};

/// Outbound at-least-once delivery tracked until its PUBACK.
struct PendingPublish {
    /// The packet as first sent; retransmission copies derive from it.
    packet: PublishPacket,
    waiter: AckResponder<()>,
    deadline: Instant,
    retries_left: u32,
}

/// At-least-once retry state machine for outbound publishes.
///
/// One task per session; pending state survives transport swaps, so a
/// publish submitted before a reconnect retries on the fresh connection.
pub struct Qos1Engine {
    cmd_rx: mpsc::Receiver<Qos1Cmd>,
    outbound_tx: mpsc::Sender<codec::MqttPacket>,
    status: Arc<StatusCell>,
    retry_interval: Duration,
    max_retries: u32,
    pending: HashMap<PacketId, PendingPublish>,
}

impl Qos1Engine {
    pub fn spawn(
        cmd_rx: mpsc::Receiver<Qos1Cmd>,
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
                    Some(Qos1Cmd::Publish { packet, waiter }) => {
                        self.on_submit(packet, waiter).await;
                    }
                    Some(Qos1Cmd::Ack(ack)) => self.on_ack(&ack),
                    Some(Qos1Cmd::Halt) | None => break,
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

        let send_result = self.outbound_tx.send(packet.clone().into()).await;
        if send_result.is_err() {
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
            },
        );
    }

    fn on_ack(&mut self, ack: &PublishAckPacket) {
        let packet_id = ack.packet_id();
        match self.pending.remove(&packet_id) {
            Some(entry) => {
                let _ = entry.waiter.send(Ok(()));
            }
            None => log::warn!("qos1: unsolicited ack for {packet_id}"),
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        // Deadlines freeze while no connection is up; retries resume on
        // the next tick after a reconnect instead of burning the budget
        // against a dead wire.
        let connected = self.status.get() == ConnectionStatus::Connected;
        let ids: Vec<PacketId> = self.pending.keys().copied().collect();

        for packet_id in ids {
            let Some(entry) = self.pending.get_mut(&packet_id) else {
                continue;
            };

            // A dropped waiter is a cancellation: forget the delivery
            // without a retry.
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
                let copy = entry.packet.dup_copy();
                log::debug!(
                    "qos1: retransmit {packet_id}, {} retries left",
                    entry.retries_left
                );
                let _ = self.outbound_tx.send(copy.into()).await;
            } else if let Some(entry) = self.pending.remove(&packet_id) {
                let _ = entry.waiter.send(Err(Error::from_string(
                    ErrorKind::Timeout,
                    format!("No ack for publish {packet_id} within retry budget"),
                )));
            }
        }
    }
}
