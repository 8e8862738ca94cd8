// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    MqttPacket, PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    QoS,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::commands::{AckWaiterCmd, HeartbeatCmd, Qos1Cmd, Qos2Cmd, SessionEvent};
use crate::dedup_cache::LruDedupCache;

/// Dedup cache housekeeping cadence.
const EVICT_PERIOD: Duration = Duration::from_secs(1);

/// Routes every decoded inbound packet to its handler.
///
/// The routing table is the heart of the acking pipeline: application
/// messages go to the consumer queue (deduplicated for QoS 1/2 and acked
/// on the spot), acknowledgements go to the engine owning the matching
/// pending state, and everything a server must not send is a protocol
/// violation.
///
/// One instance lives for the whole session; decoder stages of successive
/// connections feed the same inbound channel.
pub struct PacketRouter {
    packet_rx: mpsc::Receiver<MqttPacket>,
    outbound_tx: mpsc::Sender<MqttPacket>,

    qos1_tx: mpsc::Sender<Qos1Cmd>,
    qos2_tx: mpsc::Sender<Qos2Cmd>,
    ack_tx: mpsc::Sender<AckWaiterCmd>,
    heartbeat_tx: mpsc::Sender<HeartbeatCmd>,
    events_tx: mpsc::Sender<SessionEvent>,

    /// Consumer-visible message queue; bounded, so a slow consumer
    /// backpressures routing and, through it, the decoder.
    messages_tx: mpsc::Sender<PublishPacket>,

    dedup: LruDedupCache,
}

impl PacketRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        packet_rx: mpsc::Receiver<MqttPacket>,
        outbound_tx: mpsc::Sender<MqttPacket>,
        qos1_tx: mpsc::Sender<Qos1Cmd>,
        qos2_tx: mpsc::Sender<Qos2Cmd>,
        ack_tx: mpsc::Sender<AckWaiterCmd>,
        heartbeat_tx: mpsc::Sender<HeartbeatCmd>,
        events_tx: mpsc::Sender<SessionEvent>,
        messages_tx: mpsc::Sender<PublishPacket>,
        dedup: LruDedupCache,
    ) -> JoinHandle<()> {
        let router = Self {
            packet_rx,
            outbound_tx,
            qos1_tx,
            qos2_tx,
            ack_tx,
            heartbeat_tx,
            events_tx,
            messages_tx,
            dedup,
        };
        tokio::spawn(router.run())
    }

    async fn run(mut self) {
        let mut evict_tick = interval(EVICT_PERIOD);
        evict_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.packet_rx.recv() => match maybe {
                    Some(packet) => self.route(packet).await,
                    // Every producer is gone: session shutdown. Dropping
                    // self completes the consumer queue.
                    None => break,
                },
                _ = evict_tick.tick() => {
                    let evicted = self.dedup.evict_expired();
                    if evicted > 0 {
                        log::debug!("router: {evicted} dedup entries expired");
                    }
                },
            }
        }
    }

    async fn route(&mut self, packet: MqttPacket) {
        match packet {
            MqttPacket::Publish(publish) => self.on_publish(publish).await,
            MqttPacket::PublishAck(ack) => {
                let _ = self.qos1_tx.send(Qos1Cmd::Ack(ack)).await;
            }
            MqttPacket::PublishReceived(rec) => {
                let _ = self.qos2_tx.send(Qos2Cmd::Received(rec)).await;
            }
            MqttPacket::PublishComplete(comp) => {
                let _ = self.qos2_tx.send(Qos2Cmd::Complete(comp)).await;
            }
            MqttPacket::PublishRelease(rel) => {
                // Always confirm so the server can release its state, and
                // free the identifier for reuse.
                let packet_id = rel.packet_id();
                self.dedup.remove(packet_id);
                let _ = self
                    .outbound_tx
                    .send(PublishCompletePacket::new(packet_id).into())
                    .await;
            }
            MqttPacket::PingResponse(_resp) => {
                let _ = self.heartbeat_tx.send(HeartbeatCmd::PingResponse).await;
            }
            MqttPacket::ConnectAck(ack) => {
                let _ = self.ack_tx.send(AckWaiterCmd::ConnectAck(ack)).await;
            }
            MqttPacket::SubscribeAck(ack) => {
                let _ = self.ack_tx.send(AckWaiterCmd::SubscribeAck(ack)).await;
            }
            MqttPacket::UnsubscribeAck(ack) => {
                let _ = self.ack_tx.send(AckWaiterCmd::UnsubscribeAck(ack)).await;
            }
            MqttPacket::Disconnect(_packet) => {
                let _ = self.events_tx.send(SessionEvent::ServerDisconnect).await;
            }
            other @ (MqttPacket::Connect(_)
            | MqttPacket::Subscribe(_)
            | MqttPacket::Unsubscribe(_)
            | MqttPacket::PingRequest(_)) => {
                let message =
                    format!("Server sent client-only packet {:?}", other.packet_type());
                log::error!("router: {message}");
                let _ = self
                    .events_tx
                    .send(SessionEvent::ProtocolViolation(message))
                    .await;
            }
        }
    }

    async fn on_publish(&mut self, publish: PublishPacket) {
        match publish.qos() {
            QoS::AtMostOnce => self.emit(publish).await,
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id();
                // Ack every delivery, even re-deliveries we collapse.
                let _ = self
                    .outbound_tx
                    .send(PublishAckPacket::new(packet_id).into())
                    .await;
                if self.first_seen(&publish) {
                    self.emit(publish).await;
                }
            }
            QoS::ExactOnce => {
                let packet_id = publish.packet_id();
                let _ = self
                    .outbound_tx
                    .send(PublishReceivedPacket::new(packet_id).into())
                    .await;
                if self.first_seen(&publish) {
                    self.emit(publish).await;
                }
            }
        }
    }

    /// Record the publish in the dedup cache; true when it was not seen
    /// before.
    fn first_seen(&mut self, publish: &PublishPacket) -> bool {
        let packet_id = publish.packet_id();
        if self.dedup.contains(packet_id) {
            log::debug!("router: duplicate publish {packet_id} suppressed");
            false
        } else {
            self.dedup.add(packet_id);
            true
        }
    }

    async fn emit(&mut self, publish: PublishPacket) {
        // A consumer that dropped its message stream only loses messages,
        // it does not tear the session down.
        if self.messages_tx.send(publish).await.is_err() {
            log::debug!("router: consumer queue is gone, message dropped");
        }
    }
}
