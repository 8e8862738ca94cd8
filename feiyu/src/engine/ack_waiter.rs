// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    ConnectAckPacket, ConnectReturnCode, PacketId, SubscribeAckPacket, UnsubscribeAckPacket,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::commands::{AckResponder, AckWaiterCmd};
use crate::error::{Error, ErrorKind};

struct PendingAck<T> {
    deadline: Instant,
    waiter: AckResponder<T>,
}

/// Human readable form of a CONNACK refusal.
const fn connect_refused_message(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Accepted => "Accepted",
        ConnectReturnCode::UnacceptedProtocol => "Server rejected the protocol level",
        ConnectReturnCode::IdentifierRejected => "Server rejected the client identifier",
        ConnectReturnCode::ServerUnavailable => "MQTT service is unavailable",
        ConnectReturnCode::MalformedUsernamePassword => "Malformed username or password",
        ConnectReturnCode::Unauthorized => "Client is not authorized",
        ConnectReturnCode::Reserved => "Reserved connect return code",
    }
}

/// Correlates CONNECT/SUBSCRIBE/UNSUBSCRIBE requests with their acks and
/// enforces the action deadline on each of them.
///
/// At most one CONNECT is in flight; subscribes and unsubscribes are
/// keyed by packet id. A late ack whose waiter is gone is logged and
/// dropped.
pub struct AckWaiter {
    cmd_rx: mpsc::Receiver<AckWaiterCmd>,
    action_timeout: Duration,

    pending_connect: Option<PendingAck<ConnectAckPacket>>,
    subscribes: HashMap<PacketId, PendingAck<SubscribeAckPacket>>,
    unsubscribes: HashMap<PacketId, PendingAck<UnsubscribeAckPacket>>,
}

impl AckWaiter {
    pub fn spawn(cmd_rx: mpsc::Receiver<AckWaiterCmd>, action_timeout: Duration) -> JoinHandle<()> {
        let waiter = Self {
            cmd_rx,
            action_timeout,
            pending_connect: None,
            subscribes: HashMap::new(),
            unsubscribes: HashMap::new(),
        };
        tokio::spawn(waiter.run())
    }

    async fn run(mut self) {
        let mut tick = interval(super::tick_period(self.action_timeout));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.cmd_rx.recv() => match maybe {
                    Some(cmd) => {
                        if self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
            }
        }
    }

    /// Returns true on halt.
    fn handle(&mut self, cmd: AckWaiterCmd) -> bool {
        match cmd {
            AckWaiterCmd::ExpectConnect { waiter } => {
                if self.pending_connect.is_some() {
                    let _ = waiter.send(Err(Error::new(
                        ErrorKind::InvalidClientStatus,
                        "A connect is already in flight",
                    )));
                } else {
                    self.pending_connect = Some(PendingAck {
                        deadline: Instant::now() + self.action_timeout,
                        waiter,
                    });
                }
            }
            AckWaiterCmd::ExpectSubscribe { packet_id, waiter } => {
                self.subscribes.insert(
                    packet_id,
                    PendingAck {
                        deadline: Instant::now() + self.action_timeout,
                        waiter,
                    },
                );
            }
            AckWaiterCmd::ExpectUnsubscribe { packet_id, waiter } => {
                self.unsubscribes.insert(
                    packet_id,
                    PendingAck {
                        deadline: Instant::now() + self.action_timeout,
                        waiter,
                    },
                );
            }
            AckWaiterCmd::ConnectAck(packet) => self.on_connect_ack(packet),
            AckWaiterCmd::SubscribeAck(packet) => self.on_subscribe_ack(packet),
            AckWaiterCmd::UnsubscribeAck(packet) => self.on_unsubscribe_ack(packet),
            AckWaiterCmd::Halt => return true,
        }
        false
    }

    fn on_connect_ack(&mut self, packet: ConnectAckPacket) {
        let Some(pending) = self.pending_connect.take() else {
            log::warn!("ack_waiter: connack without a pending connect");
            return;
        };
        let result = if packet.return_code() == ConnectReturnCode::Accepted {
            Ok(packet)
        } else {
            Err(Error::new(
                ErrorKind::ProtocolError,
                connect_refused_message(packet.return_code()),
            ))
        };
        let _ = pending.waiter.send(result);
    }

    fn on_subscribe_ack(&mut self, packet: SubscribeAckPacket) {
        let packet_id = packet.packet_id();
        let Some(pending) = self.subscribes.remove(&packet_id) else {
            log::warn!("ack_waiter: late suback for {packet_id} ignored");
            return;
        };
        let result = if packet.acks().iter().any(codec::SubscribeAck::is_failed) {
            Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("Server rejected subscription {packet_id}: {:?}", packet.acks()),
            ))
        } else {
            Ok(packet)
        };
        let _ = pending.waiter.send(result);
    }

    fn on_unsubscribe_ack(&mut self, packet: UnsubscribeAckPacket) {
        let packet_id = packet.packet_id();
        match self.unsubscribes.remove(&packet_id) {
            Some(pending) => {
                let _ = pending.waiter.send(Ok(packet));
            }
            None => log::warn!("ack_waiter: late unsuback for {packet_id} ignored"),
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        if let Some(pending) = &self.pending_connect {
            if pending.waiter.is_closed() || pending.deadline <= now {
                if let Some(pending) = self.pending_connect.take() {
                    let _ = pending.waiter.send(Err(Error::new(
                        ErrorKind::Timeout,
                        "No connack within the action deadline",
                    )));
                }
            }
        }

        Self::expire(&mut self.subscribes, now, "suback");
        Self::expire(&mut self.unsubscribes, now, "unsuback");
    }

    fn expire<T>(map: &mut HashMap<PacketId, PendingAck<T>>, now: Instant, what: &str) {
        let overdue: Vec<PacketId> = map
            .iter()
            .filter(|(_id, pending)| pending.waiter.is_closed() || pending.deadline <= now)
            .map(|(id, _pending)| *id)
            .collect();
        for packet_id in overdue {
            if let Some(pending) = map.remove(&packet_id) {
                let _ = pending.waiter.send(Err(Error::from_string(
                    ErrorKind::Timeout,
                    format!("No {what} for {packet_id} within the action deadline"),
                )));
            }
        }
    }
}
