// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    ConnectPacket, DisconnectPacket, MqttPacket, PublishPacket, QoS, SubscribePacket,
    SubscribeTopic, UnsubscribePacket,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::byte_channel::DuplexByteChannel;
use crate::commands::{
    AckResponder, AckWaiterCmd, EncoderCmd, HeartbeatCmd, Qos1Cmd, Qos2Cmd, SessionEvent,
    SupervisorCmd,
};
use crate::connect_options::ConnectOptions;
use crate::dedup_cache::LruDedupCache;
use crate::engine::{AckWaiter, Heartbeat, Qos1Engine, Qos2Engine};
use crate::error::{Error, ErrorKind};
use crate::packet_ids::PacketIdSource;
use crate::pipeline::{DecoderStage, EncoderStage, PacketRouter};
use crate::status::{ConnectionStatus, StatusCell};
use crate::transport::{Stream, TransportDriver};
use crate::types::{DisconnectEvent, DisconnectReason};

/// Time budget for draining writes on a graceful close and for awaiting
/// the termination of an aborted transport.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Queue depths. The outbound queue is the deepest one since engines keep
/// re-enqueueing retransmissions into it.
const OUTBOUND_QUEUE: usize = 128;
const PACKET_QUEUE: usize = 64;
const MESSAGE_QUEUE: usize = 64;
const CMD_QUEUE: usize = 16;

/// Channel ends the client facade keeps after the session is assembled.
pub(crate) struct SessionHandles {
    pub cmd_tx: mpsc::Sender<SupervisorCmd>,
    pub qos1_tx: mpsc::Sender<Qos1Cmd>,
    pub qos2_tx: mpsc::Sender<Qos2Cmd>,
    pub outbound_tx: mpsc::Sender<MqttPacket>,
    pub packet_ids: Arc<PacketIdSource>,
    pub status: Arc<StatusCell>,
    pub terminated_rx: watch::Receiver<Option<DisconnectReason>>,
    pub messages_rx: mpsc::Receiver<PublishPacket>,
}

/// Build every engine and stage of a session and spawn the supervisor.
pub(crate) fn start_session(options: ConnectOptions) -> SessionHandles {
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE);
    let (events_tx, events_rx) = mpsc::channel(CMD_QUEUE);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
    let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_QUEUE);
    let (qos1_tx, qos1_rx) = mpsc::channel(CMD_QUEUE);
    let (qos2_tx, qos2_rx) = mpsc::channel(CMD_QUEUE);
    let (ack_tx, ack_rx) = mpsc::channel(CMD_QUEUE);
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(CMD_QUEUE);
    let (encoder_ctrl_tx, encoder_ctrl_rx) = mpsc::channel(4);
    let (terminated_tx, terminated_rx) = watch::channel(None);

    let status = StatusCell::new();
    let packet_ids = Arc::new(PacketIdSource::new());

    Qos1Engine::spawn(
        qos1_rx,
        outbound_tx.clone(),
        Arc::clone(&status),
        options.publish_retry_interval(),
        options.max_publish_retries(),
    );
    Qos2Engine::spawn(
        qos2_rx,
        outbound_tx.clone(),
        Arc::clone(&status),
        options.publish_retry_interval(),
        options.max_publish_retries(),
    );
    // The action deadline for CONNECT/SUBSCRIBE/UNSUBSCRIBE follows the
    // publish retry interval, floored so a zero retry interval (legal for
    // publishes) cannot starve the connect handshake.
    let action_timeout = options
        .publish_retry_interval()
        .max(Duration::from_secs(1));
    AckWaiter::spawn(ack_rx, action_timeout);
    Heartbeat::spawn(
        heartbeat_rx,
        outbound_tx.clone(),
        events_tx.clone(),
        options.keep_alive(),
    );
    EncoderStage::spawn(
        outbound_rx,
        encoder_ctrl_rx,
        options.max_frame_size(),
        options.max_packet_size(),
    );
    let router_task = PacketRouter::spawn(
        packet_rx,
        outbound_tx.clone(),
        qos1_tx.clone(),
        qos2_tx.clone(),
        ack_tx.clone(),
        heartbeat_tx.clone(),
        events_tx.clone(),
        messages_tx,
        LruDedupCache::new(
            options.max_retained_packet_ids(),
            options.max_packet_id_retention(),
        ),
    );

    let supervisor = SessionSupervisor {
        attempts_left: options.max_reconnect_attempts(),
        options,
        cmd_rx,
        events_rx,
        events_tx,
        outbound_tx: outbound_tx.clone(),
        router_packet_tx: Some(packet_tx),
        router_task: Some(router_task),
        encoder_ctrl_tx,
        qos1_tx: qos1_tx.clone(),
        qos2_tx: qos2_tx.clone(),
        ack_tx,
        heartbeat_tx,
        packet_ids: Arc::clone(&packet_ids),
        status: Arc::clone(&status),
        terminated_tx,
        saved_subscriptions: BTreeMap::new(),
        transport: None,
        transport_terminated: None,
        decoder_task: None,
    };
    tokio::spawn(supervisor.run());

    SessionHandles {
        cmd_tx,
        qos1_tx,
        qos2_tx,
        outbound_tx,
        packet_ids,
        status,
        terminated_rx,
        messages_rx,
    }
}

/// Wait for the tracked transport to terminate; pending forever when no
/// transport is up.
async fn wait_transport(
    rx: &mut Option<watch::Receiver<Option<DisconnectEvent>>>,
) -> DisconnectEvent {
    match rx {
        Some(rx) => loop {
            let current = rx.borrow().clone();
            if let Some(event) = current {
                return event;
            }
            if rx.changed().await.is_err() {
                return DisconnectEvent::Normal;
            }
        },
        None => std::future::pending().await,
    }
}

/// Owns the connection lifecycle: connect, reconnect with subscription
/// replay, graceful disconnect, and the final terminated signal.
///
/// Engines, router and encoder live for the whole session; the transport
/// driver and the decoder stage are per connection and get rebuilt on
/// every reconnect. The saved subscription set is updated when a
/// subscribe or unsubscribe is submitted, not when it is acknowledged, so
/// a filter whose ack never arrived is still replayed.
struct SessionSupervisor {
    options: ConnectOptions,
    cmd_rx: mpsc::Receiver<SupervisorCmd>,
    events_rx: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,

    outbound_tx: mpsc::Sender<MqttPacket>,

    /// Stable inbound end of the router; cloned into each decoder stage.
    /// Dropped at shutdown so the router drains and exits.
    router_packet_tx: Option<mpsc::Sender<MqttPacket>>,
    router_task: Option<JoinHandle<()>>,

    encoder_ctrl_tx: mpsc::Sender<EncoderCmd>,
    qos1_tx: mpsc::Sender<Qos1Cmd>,
    qos2_tx: mpsc::Sender<Qos2Cmd>,
    ack_tx: mpsc::Sender<AckWaiterCmd>,
    heartbeat_tx: mpsc::Sender<HeartbeatCmd>,

    packet_ids: Arc<PacketIdSource>,
    status: Arc<StatusCell>,
    terminated_tx: watch::Sender<Option<DisconnectReason>>,

    /// Authoritative replay set, filter to requested QoS.
    saved_subscriptions: BTreeMap<String, QoS>,

    attempts_left: u32,

    transport: Option<TransportDriver>,
    transport_terminated: Option<watch::Receiver<Option<DisconnectEvent>>>,
    decoder_task: Option<JoinHandle<()>>,
}

impl SessionSupervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => {
                        if self.handle_cmd(cmd).await {
                            break;
                        }
                    }
                    None => {
                        // The facade is gone; fold the session quietly.
                        self.shutdown(DisconnectReason::NormalDisconnection).await;
                        break;
                    }
                },
                maybe_event = self.events_rx.recv() => {
                    if let Some(event) = maybe_event {
                        if self.handle_event(event).await {
                            break;
                        }
                    }
                },
                event = wait_transport(&mut self.transport_terminated),
                    if self.transport_terminated.is_some() =>
                {
                    if self.on_connection_lost(event).await {
                        break;
                    }
                },
            }
        }
        log::debug!("session: supervisor finished");
    }

    /// Returns true when the session is over.
    async fn handle_cmd(&mut self, cmd: SupervisorCmd) -> bool {
        match cmd {
            SupervisorCmd::Connect { waiter } => {
                self.on_connect(waiter).await;
                false
            }
            SupervisorCmd::Subscribe { filters, waiter } => {
                self.on_subscribe(filters, waiter).await;
                false
            }
            SupervisorCmd::Unsubscribe { filters, waiter } => {
                self.on_unsubscribe(filters, waiter).await;
                false
            }
            SupervisorCmd::Disconnect { waiter } => {
                self.on_disconnect().await;
                let _ = waiter.send(());
                true
            }
        }
    }

    /// Returns true when the session is over.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        let event = match event {
            SessionEvent::ServerDisconnect => {
                DisconnectEvent::ServerRequested(DisconnectReason::ServerShuttingDown)
            }
            SessionEvent::ProtocolViolation(_msg) => {
                DisconnectEvent::ServerRequested(DisconnectReason::ProtocolError)
            }
            SessionEvent::KeepAliveTimeout => DisconnectEvent::KeepAliveTimeout,
        };
        self.on_connection_lost(event).await
    }

    async fn on_connect(&mut self, waiter: AckResponder<bool>) {
        match self.status.get() {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                let _ = waiter.send(Err(Error::new(
                    ErrorKind::InvalidClientStatus,
                    "Already connected or connecting",
                )));
                return;
            }
            _ => {}
        }

        match self.establish_connection().await {
            Ok(session_present) => {
                // The attempt budget refills only on an accepted CONNACK.
                self.attempts_left = self.options.max_reconnect_attempts();
                let _ = waiter.send(Ok(session_present));
            }
            Err(err) => {
                self.status.set(ConnectionStatus::Failed);
                log::warn!("session: connect failed: {err}");
                let _ = waiter.send(Err(err));
            }
        }
    }

    /// Build a fresh transport and per-connection pipeline, send CONNECT
    /// and wait for its CONNACK.
    async fn establish_connection(&mut self) -> Result<bool, Error> {
        self.status.set(ConnectionStatus::Connecting);

        let (app_pipes, transport_pipes) =
            DuplexByteChannel::new(self.options.max_frame_size());
        let stream =
            Stream::connect(self.options.connect_type(), self.options.connect_timeout()).await?;
        let driver = TransportDriver::start(stream, transport_pipes, Arc::clone(&self.status));

        let packet_tx = self
            .router_packet_tx
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::InvalidClientStatus, "Session is shut down"))?;
        let decoder_task =
            DecoderStage::spawn(app_pipes.reader, packet_tx, self.events_tx.clone());

        // The swap is acknowledged before CONNECT is queued so leftovers
        // of the previous connection cannot precede it on the wire.
        let (installed_tx, installed_rx) = oneshot::channel();
        self.encoder_ctrl_tx
            .send(EncoderCmd::SwapSink {
                writer: app_pipes.writer,
                installed: installed_tx,
            })
            .await?;
        installed_rx.await?;

        let (connack_tx, connack_rx) = oneshot::channel();
        self.ack_tx
            .send(AckWaiterCmd::ExpectConnect { waiter: connack_tx })
            .await?;
        let connect_packet = self.build_connect_packet()?;
        self.outbound_tx.send(connect_packet.into()).await?;

        match connack_rx.await {
            Ok(Ok(connack)) => {
                self.status.set(ConnectionStatus::Connected);
                self.transport_terminated = Some(driver.when_terminated());
                self.transport = Some(driver);
                self.decoder_task = Some(decoder_task);
                let _ = self.heartbeat_tx.send(HeartbeatCmd::Activate).await;
                Ok(connack.session_present())
            }
            Ok(Err(err)) => {
                driver.abort();
                Err(err)
            }
            Err(recv_err) => {
                driver.abort();
                Err(recv_err.into())
            }
        }
    }

    fn build_connect_packet(&self) -> Result<ConnectPacket, Error> {
        let mut packet = ConnectPacket::new(self.options.client_id())?;
        packet.set_protocol_level(self.options.protocol_level());
        packet.set_clean_session(self.options.clean_session());
        #[allow(clippy::cast_possible_truncation)]
        packet.set_keep_alive(self.options.keep_alive().as_secs().min(u64::from(u16::MAX)) as u16);
        if let Some(will) = self.options.last_will() {
            packet.set_will(&will.topic, &will.message, will.qos, will.retain)?;
        }
        if let Some(username) = self.options.username() {
            packet.set_username(username)?;
        }
        if let Some(password) = self.options.password() {
            packet.set_password(password)?;
        }
        Ok(packet)
    }

    async fn on_subscribe(
        &mut self,
        filters: Vec<SubscribeTopic>,
        waiter: AckResponder<codec::SubscribeAckPacket>,
    ) {
        if self.status.get() != ConnectionStatus::Connected {
            let _ = waiter.send(Err(Error::new(
                ErrorKind::InvalidClientStatus,
                "Not connected",
            )));
            return;
        }

        // Memoized on submit: replayed after a reconnect even if this
        // subscribe never gets its ack.
        for filter in &filters {
            self.saved_subscriptions
                .insert(filter.topic().to_string(), filter.qos());
        }

        let packet_id = self.packet_ids.next_id();
        let packet = match SubscribePacket::with_topics(packet_id, filters) {
            Ok(packet) => packet,
            Err(err) => {
                let _ = waiter.send(Err(err.into()));
                return;
            }
        };

        if let Err(send_err) = self
            .ack_tx
            .send(AckWaiterCmd::ExpectSubscribe { packet_id, waiter })
            .await
        {
            if let AckWaiterCmd::ExpectSubscribe { waiter, .. } = send_err.0 {
                let _ = waiter.send(Err(Error::new(
                    ErrorKind::ChannelError,
                    "Ack correlator is gone",
                )));
            }
            return;
        }
        if let Err(err) = self.outbound_tx.send(packet.into()).await {
            log::error!("session: failed to queue subscribe: {err}");
        }
    }

    async fn on_unsubscribe(
        &mut self,
        filters: Vec<codec::SubTopic>,
        waiter: AckResponder<codec::UnsubscribeAckPacket>,
    ) {
        if self.status.get() != ConnectionStatus::Connected {
            let _ = waiter.send(Err(Error::new(
                ErrorKind::InvalidClientStatus,
                "Not connected",
            )));
            return;
        }

        // Dropped from the replay set on submit, mirroring subscribe.
        for filter in &filters {
            self.saved_subscriptions.remove(filter.as_ref());
        }

        let packet_id = self.packet_ids.next_id();
        let packet = match UnsubscribePacket::with_topics(packet_id, filters) {
            Ok(packet) => packet,
            Err(err) => {
                let _ = waiter.send(Err(err.into()));
                return;
            }
        };

        if let Err(send_err) = self
            .ack_tx
            .send(AckWaiterCmd::ExpectUnsubscribe { packet_id, waiter })
            .await
        {
            if let AckWaiterCmd::ExpectUnsubscribe { waiter, .. } = send_err.0 {
                let _ = waiter.send(Err(Error::new(
                    ErrorKind::ChannelError,
                    "Ack correlator is gone",
                )));
            }
            return;
        }
        if let Err(err) = self.outbound_tx.send(packet.into()).await {
            log::error!("session: failed to queue unsubscribe: {err}");
        }
    }

    /// A connection died underneath a running session. Burn reconnect
    /// attempts until one works or the budget is gone.
    ///
    /// Returns true when the session is over.
    async fn on_connection_lost(&mut self, event: DisconnectEvent) -> bool {
        if self.transport.is_none() && self.status.get() != ConnectionStatus::Connected {
            // Leftover of a connection already torn down.
            log::debug!("session: stale event ignored: {event:?}");
            return false;
        }
        log::warn!("session: connection lost: {event:?}");
        let _ = self.heartbeat_tx.send(HeartbeatCmd::Suspend).await;
        self.teardown_connection().await;

        loop {
            if self.attempts_left == 0 {
                log::error!("session: reconnect budget exhausted");
                self.shutdown(event.terminal_reason()).await;
                return true;
            }
            self.attempts_left -= 1;
            log::info!(
                "session: reconnecting, {} attempts left",
                self.attempts_left
            );

            match self.reconnect_once().await {
                Ok(()) => {
                    self.attempts_left = self.options.max_reconnect_attempts();
                    self.drain_stale_events();
                    log::info!("session: reconnected");
                    return false;
                }
                Err(err) => {
                    log::warn!("session: reconnect attempt failed: {err}");
                    self.teardown_connection().await;
                }
            }
        }
    }

    /// One full reconnect attempt: fresh transport and pipeline, CONNECT,
    /// then one SUBSCRIBE replaying every saved filter.
    async fn reconnect_once(&mut self) -> Result<(), Error> {
        let _session_present = self.establish_connection().await?;

        if self.saved_subscriptions.is_empty() {
            return Ok(());
        }

        let mut topics = Vec::with_capacity(self.saved_subscriptions.len());
        for (filter, qos) in &self.saved_subscriptions {
            topics.push(SubscribeTopic::new(filter, *qos)?);
        }
        let packet_id = self.packet_ids.next_id();
        let packet = SubscribePacket::with_topics(packet_id, topics)?;

        let (suback_tx, suback_rx) = oneshot::channel();
        self.ack_tx
            .send(AckWaiterCmd::ExpectSubscribe {
                packet_id,
                waiter: suback_tx,
            })
            .await?;
        self.outbound_tx.send(packet.into()).await?;

        // The ack waiter enforces the action deadline, so this await is
        // bounded.
        suback_rx.await??;
        Ok(())
    }

    /// Abort the current transport, wait briefly for its loops to stop
    /// and drop stale per-connection state.
    async fn teardown_connection(&mut self) {
        if let Some(driver) = self.transport.take() {
            driver.abort();
            if tokio::time::timeout(SHUTDOWN_GRACE, driver.terminated())
                .await
                .is_err()
            {
                log::warn!("session: transport ignored the abort grace");
            }
        }
        self.transport_terminated = None;
        if let Some(task) = self.decoder_task.take() {
            // Normally already finished since its pipe completed.
            task.abort();
        }
        self.drain_stale_events();
    }

    /// Discard queued events that belong to the connection just torn
    /// down.
    fn drain_stale_events(&mut self) {
        while self.events_rx.try_recv().is_ok() {}
    }

    async fn on_disconnect(&mut self) {
        if self.status.get() == ConnectionStatus::Connected {
            let _ = self.heartbeat_tx.send(HeartbeatCmd::Suspend).await;
            if let Err(err) = self
                .outbound_tx
                .send(DisconnectPacket::new().into())
                .await
            {
                log::warn!("session: failed to queue disconnect packet: {err}");
            }

            // Make sure the DISCONNECT reached the byte pipe before the
            // transport stops accepting bytes.
            let (done_tx, done_rx) = oneshot::channel();
            if self
                .encoder_ctrl_tx
                .send(EncoderCmd::Flush(done_tx))
                .await
                .is_ok()
            {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await;
            }

            if let Some(driver) = self.transport.take() {
                driver.close(SHUTDOWN_GRACE).await;
            }
        }
        self.shutdown(DisconnectReason::NormalDisconnection).await;
    }

    /// Stop every long-lived task and resolve the terminated signal.
    /// No user message is surfaced after this returns.
    async fn shutdown(&mut self, reason: DisconnectReason) {
        log::info!("session: shutdown, reason: {reason}");

        if let Some(driver) = self.transport.take() {
            driver.abort();
        }
        self.transport_terminated = None;
        if let Some(task) = self.decoder_task.take() {
            task.abort();
        }

        let _ = self.qos1_tx.send(Qos1Cmd::Halt).await;
        let _ = self.qos2_tx.send(Qos2Cmd::Halt).await;
        let _ = self.ack_tx.send(AckWaiterCmd::Halt).await;
        let _ = self.heartbeat_tx.send(HeartbeatCmd::Halt).await;
        let _ = self.encoder_ctrl_tx.send(EncoderCmd::Halt).await;

        // Dropping the stable inbound sender lets the router drain and
        // close the consumer queue; terminated resolves only after that,
        // so no message can surface past it.
        self.router_packet_tx = None;
        if let Some(router_task) = self.router_task.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, router_task).await;
        }

        match reason {
            DisconnectReason::NormalDisconnection => {
                self.status.set(ConnectionStatus::Disconnected);
            }
            _ => {
                if self.status.get() != ConnectionStatus::Aborted {
                    self.status.set(ConnectionStatus::Failed);
                }
            }
        }
        let _ = self.terminated_tx.send(Some(reason));
    }
}
