// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    ConnectAckPacket, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, SubTopic, SubscribeAckPacket, SubscribeTopic, UnsubscribeAckPacket,
};
use tokio::sync::oneshot;

use crate::byte_channel::PipeWriter;
use crate::error::Error;

/// One-shot reply carried inside a request; resolving it answers the
/// caller, dropping it cancels the operation.
pub type AckResponder<T> = oneshot::Sender<Result<T, Error>>;

/// Mailbox of the QoS 1 engine.
#[derive(Debug)]
pub enum Qos1Cmd {
    /// Track an at-least-once publish until its PUBACK.
    Publish {
        packet: PublishPacket,
        waiter: AckResponder<()>,
    },

    /// A PUBACK arrived from the server.
    Ack(PublishAckPacket),

    Halt,
}

/// Mailbox of the QoS 2 engine.
#[derive(Debug)]
pub enum Qos2Cmd {
    /// Track an exactly-once publish through the full handshake.
    Publish {
        packet: PublishPacket,
        waiter: AckResponder<()>,
    },

    /// A PUBREC arrived from the server.
    Received(PublishReceivedPacket),

    /// A PUBCOMP arrived from the server.
    Complete(PublishCompletePacket),

    Halt,
}

/// Mailbox of the CONNECT/SUBSCRIBE/UNSUBSCRIBE correlator.
#[derive(Debug)]
pub enum AckWaiterCmd {
    ExpectConnect {
        waiter: AckResponder<ConnectAckPacket>,
    },
    ExpectSubscribe {
        packet_id: PacketId,
        waiter: AckResponder<SubscribeAckPacket>,
    },
    ExpectUnsubscribe {
        packet_id: PacketId,
        waiter: AckResponder<UnsubscribeAckPacket>,
    },

    ConnectAck(ConnectAckPacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),

    Halt,
}

/// Mailbox of the keep-alive scheduler.
#[derive(Debug)]
pub enum HeartbeatCmd {
    /// A connection is up; start probing and reset the silence clock.
    Activate,

    /// The transport went away; stop probing.
    Suspend,

    /// A PINGRESP arrived from the server.
    PingResponse,

    Halt,
}

/// Control channel of the encoder stage.
#[derive(Debug)]
pub enum EncoderCmd {
    /// Route encoded frames into a fresh transport.
    ///
    /// Packets still queued for the previous connection are discarded
    /// first so nothing precedes the CONNECT of the new one; `installed`
    /// resolves once the swap is effective.
    SwapSink {
        writer: PipeWriter,
        installed: oneshot::Sender<()>,
    },

    /// Drain everything already queued into the sink, then reply.
    Flush(oneshot::Sender<()>),

    Halt,
}

/// Requests from the client facade to the session supervisor.
#[derive(Debug)]
pub enum SupervisorCmd {
    /// Establish the first connection. Resolves with the session-present
    /// flag of the CONNACK.
    Connect { waiter: AckResponder<bool> },

    Subscribe {
        filters: Vec<SubscribeTopic>,
        waiter: AckResponder<SubscribeAckPacket>,
    },

    Unsubscribe {
        filters: Vec<SubTopic>,
        waiter: AckResponder<UnsubscribeAckPacket>,
    },

    /// Graceful shutdown; always succeeds.
    Disconnect { waiter: oneshot::Sender<()> },
}

/// Coarse connection-scope events flowing up to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server sent a DISCONNECT packet.
    ServerDisconnect,

    /// The inbound stream broke the protocol; the connection must die.
    ProtocolViolation(String),

    /// The keep-alive detector declared the server gone.
    KeepAliveTimeout,
}
