// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    MqttPacket, PublishPacket, QoS, SubTopic, SubscribeAckPacket, SubscribeTopic,
    UnsubscribeAckPacket,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};

use crate::commands::{Qos1Cmd, Qos2Cmd, SupervisorCmd};
use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};
use crate::packet_ids::PacketIdSource;
use crate::status::{ConnectionStatus, StatusCell};
use crate::supervisor::{start_session, SessionHandles};
use crate::types::DisconnectReason;

/// Ordered, deduplicated sequence of inbound publishes.
///
/// Finite: the stream ends when the session shuts down, and no item is
/// yielded after `when_terminated` resolved.
pub struct MessageStream {
    rx: mpsc::Receiver<PublishPacket>,
}

impl MessageStream {
    /// Wait for the next message; `None` once the session is over.
    pub async fn recv(&mut self) -> Option<PublishPacket> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = PublishPacket;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Asynchronous MQTT 3.1.1 client.
///
/// All I/O and protocol state live in background tasks; this handle only
/// sends typed requests to them and awaits replies. Dropping a pending
/// call cancels the operation: a publish whose future is dropped is
/// removed from its retry engine without another retransmission.
pub struct AsyncClient {
    cmd_tx: mpsc::Sender<SupervisorCmd>,
    qos1_tx: mpsc::Sender<Qos1Cmd>,
    qos2_tx: mpsc::Sender<Qos2Cmd>,
    outbound_tx: mpsc::Sender<MqttPacket>,
    packet_ids: Arc<PacketIdSource>,
    status: Arc<StatusCell>,
    terminated_rx: watch::Receiver<Option<DisconnectReason>>,
    messages: MessageStream,
}

impl AsyncClient {
    /// Assemble a session from `options`. Nothing touches the network
    /// until [`AsyncClient::connect`] is called.
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        let SessionHandles {
            cmd_tx,
            qos1_tx,
            qos2_tx,
            outbound_tx,
            packet_ids,
            status,
            terminated_rx,
            messages_rx,
        } = start_session(options);

        Self {
            cmd_tx,
            qos1_tx,
            qos2_tx,
            outbound_tx,
            packet_ids,
            status,
            terminated_rx,
            messages: MessageStream { rx: messages_rx },
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Connect to the server. Resolves with the session-present flag of
    /// the CONNACK.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be established, the server
    /// refuses the CONNECT, or no CONNACK arrives within the action
    /// deadline.
    pub async fn connect(&mut self) -> Result<bool, Error> {
        let (waiter, reply) = oneshot::channel();
        self.cmd_tx
            .send(SupervisorCmd::Connect { waiter })
            .await
            .map_err(|_err| session_gone())?;
        reply.await?
    }

    /// Publish `data` to `topic`.
    ///
    /// QoS 0 resolves as soon as the packet is queued; QoS 1 resolves on
    /// PUBACK and QoS 2 after the full handshake.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is invalid, the client is not
    /// connected, the retry budget runs out, or the server rejects the
    /// delivery.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut packet = PublishPacket::new(topic, qos, data)?;
        packet.set_retain(retain);

        if self.status.get() != ConnectionStatus::Connected {
            return Err(Error::new(ErrorKind::InvalidClientStatus, "Not connected"));
        }

        match qos {
            QoS::AtMostOnce => {
                self.outbound_tx
                    .send(packet.into())
                    .await
                    .map_err(|_err| session_gone())?;
                Ok(())
            }
            QoS::AtLeastOnce => {
                packet.set_packet_id(self.packet_ids.next_id());
                let (waiter, reply) = oneshot::channel();
                self.qos1_tx
                    .send(Qos1Cmd::Publish { packet, waiter })
                    .await
                    .map_err(|_err| session_gone())?;
                reply.await?
            }
            QoS::ExactOnce => {
                packet.set_packet_id(self.packet_ids.next_id());
                let (waiter, reply) = oneshot::channel();
                self.qos2_tx
                    .send(Qos2Cmd::Publish { packet, waiter })
                    .await
                    .map_err(|_err| session_gone())?;
                reply.await?
            }
        }
    }

    /// Subscribe to a single topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is invalid, the client is not
    /// connected, the server rejects the filter or the SUBACK never
    /// arrives.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscribeAckPacket, Error> {
        self.subscribe_filters(&[(topic, qos)]).await
    }

    /// Subscribe to several topic filters with one packet.
    ///
    /// # Errors
    ///
    /// See [`AsyncClient::subscribe`].
    pub async fn subscribe_filters(
        &self,
        filters: &[(&str, QoS)],
    ) -> Result<SubscribeAckPacket, Error> {
        let mut topics = Vec::with_capacity(filters.len());
        for (filter, qos) in filters {
            topics.push(SubscribeTopic::new(filter, *qos)?);
        }

        let (waiter, reply) = oneshot::channel();
        self.cmd_tx
            .send(SupervisorCmd::Subscribe {
                filters: topics,
                waiter,
            })
            .await
            .map_err(|_err| session_gone())?;
        reply.await?
    }

    /// Remove subscriptions for the given filters.
    ///
    /// # Errors
    ///
    /// Returns error if a filter is invalid, the client is not connected
    /// or the UNSUBACK never arrives.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<UnsubscribeAckPacket, Error> {
        let mut filters = Vec::with_capacity(topics.len());
        for topic in topics {
            filters.push(SubTopic::new(topic)?);
        }

        let (waiter, reply) = oneshot::channel();
        self.cmd_tx
            .send(SupervisorCmd::Unsubscribe { filters, waiter })
            .await
            .map_err(|_err| session_gone())?;
        reply.await?
    }

    /// Graceful shutdown: DISCONNECT is sent, pending writes drain, the
    /// terminated signal resolves with `NormalDisconnection`. Further
    /// calls fail fast.
    pub async fn disconnect(&mut self) {
        let (waiter, reply) = oneshot::channel();
        if self
            .cmd_tx
            .send(SupervisorCmd::Disconnect { waiter })
            .await
            .is_ok()
        {
            let _ = reply.await;
        }
    }

    /// Wait for the next inbound publish; `None` once the session is
    /// over.
    pub async fn next_message(&mut self) -> Option<PublishPacket> {
        self.messages.recv().await
    }

    /// Get the inbound message stream for `futures::StreamExt` style
    /// consumption.
    pub fn messages_mut(&mut self) -> &mut MessageStream {
        &mut self.messages
    }

    /// Resolves once, with the terminal reason of the session.
    pub async fn when_terminated(&self) -> DisconnectReason {
        let mut rx = self.terminated_rx.clone();
        loop {
            let current = *rx.borrow();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return DisconnectReason::UnspecifiedError;
            }
        }
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        if self.status.get() == ConnectionStatus::Connected {
            // Best effort notification; the supervisor also folds when
            // the command channel itself closes.
            let (waiter, _reply) = oneshot::channel();
            let _ = self.cmd_tx.try_send(SupervisorCmd::Disconnect { waiter });
        }
    }
}

fn session_gone() -> Error {
    Error::new(ErrorKind::InvalidClientStatus, "Session is shut down")
}
