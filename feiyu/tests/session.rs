// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Session level scenarios driven against a scripted broker stub speaking
//! real wire bytes over the in-memory loopback transport.

use std::collections::VecDeque;
use std::time::Duration;

use codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, EncodePacket, MqttPacket, PacketId,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, QoS, StreamDecoder, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket,
};
use feiyu::{
    AsyncClient, ConnectOptions, ConnectType, ConnectionStatus, DisconnectReason, ErrorKind,
    MemoryConnect,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

const STEP: Duration = Duration::from_secs(5);

/// One accepted loopback connection, seen from the broker side.
struct BrokerStub {
    stream: DuplexStream,
    decoder: StreamDecoder,
    queue: VecDeque<MqttPacket>,
}

impl BrokerStub {
    async fn accept(accept_rx: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Self {
        let stream = timeout(STEP, accept_rx.recv())
            .await
            .expect("no connection within the accept deadline")
            .expect("acceptor closed");
        Self {
            stream,
            decoder: StreamDecoder::new(),
            queue: VecDeque::new(),
        }
    }

    async fn recv_packet(&mut self) -> MqttPacket {
        loop {
            if let Some(packet) = self.queue.pop_front() {
                return packet;
            }
            let mut buf = vec![0u8; 4096];
            let n = timeout(STEP, self.stream.read(&mut buf))
                .await
                .expect("no packet within the read deadline")
                .expect("stub read failed");
            assert!(n > 0, "client closed the connection");
            self.decoder.extend(&buf[..n]);
            self.queue
                .extend(self.decoder.decode_packets().expect("stub decode failed"));
        }
    }

    /// Next packet if one arrives within `wait`, `None` on silence or a
    /// closed connection.
    async fn try_recv_packet(&mut self, wait: Duration) -> Option<MqttPacket> {
        if let Some(packet) = self.queue.pop_front() {
            return Some(packet);
        }
        let mut buf = vec![0u8; 4096];
        match timeout(wait, self.stream.read(&mut buf)).await {
            Err(_silence) => None,
            Ok(Err(_)) | Ok(Ok(0)) => None,
            Ok(Ok(n)) => {
                self.decoder.extend(&buf[..n]);
                self.queue
                    .extend(self.decoder.decode_packets().expect("stub decode failed"));
                self.queue.pop_front()
            }
        }
    }

    async fn send<P: EncodePacket>(&mut self, packet: P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).expect("stub encode failed");
        self.stream
            .write_all(&buf)
            .await
            .expect("stub write failed");
    }

    /// Consume the CONNECT and accept it.
    async fn handshake(&mut self) -> ConnectPacket {
        let MqttPacket::Connect(connect) = self.recv_packet().await else {
            panic!("expected CONNECT first");
        };
        self.send(ConnectAckPacket::new(false, ConnectReturnCode::Accepted))
            .await;
        connect
    }

    fn expect_publish(packet: MqttPacket) -> PublishPacket {
        match packet {
            MqttPacket::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    fn expect_subscribe(packet: MqttPacket) -> SubscribePacket {
        match packet {
            MqttPacket::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
    }
}

/// Loopback options with keep-alive disabled so the wire stays scripted.
fn memory_options() -> (ConnectOptions, mpsc::UnboundedReceiver<DuplexStream>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let mut options = ConnectOptions::default();
    options
        .set_connect_type(ConnectType::Memory(MemoryConnect { accept_tx }))
        .set_client_id("feiyutest")
        .set_keep_alive(Duration::ZERO);
    (options, accept_rx)
}

async fn connected_pair(
    options: ConnectOptions,
    accept_rx: &mut mpsc::UnboundedReceiver<DuplexStream>,
) -> (AsyncClient, BrokerStub) {
    let mut client = AsyncClient::new(options);
    let (connect_result, stub) = tokio::join!(client.connect(), async {
        let mut stub = BrokerStub::accept(accept_rx).await;
        let connect = stub.handshake().await;
        assert_eq!(connect.client_id(), "feiyutest");
        stub
    });
    let session_present = assert_ok!(connect_result);
    assert!(!session_present);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    (client, stub)
}

#[tokio::test]
async fn test_publish_qos1_round_trip() {
    let (options, mut accept_rx) = memory_options();
    let (client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (publish_result, _) = tokio::join!(
        client.publish("t1", QoS::AtLeastOnce, false, &[0x01, 0x02, 0x03]),
        async {
            let publish = BrokerStub::expect_publish(stub.recv_packet().await);
            assert_eq!(publish.topic(), "t1");
            assert_eq!(publish.message(), &[0x01, 0x02, 0x03]);
            assert_eq!(publish.qos(), QoS::AtLeastOnce);
            assert!(!publish.dup());
            stub.send(PublishAckPacket::new(publish.packet_id())).await;
        }
    );
    assert_ok!(publish_result);

    // Acked delivery: nothing may be retransmitted.
    assert!(stub.try_recv_packet(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_qos1_retry_until_budget_exhausted() {
    let (mut options, mut accept_rx) = memory_options();
    options
        .set_publish_retry_interval(Duration::ZERO)
        .set_max_publish_retries(3);
    let (client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (publish_result, wire_publishes) = tokio::join!(
        client.publish("t1", QoS::AtLeastOnce, false, b"payload"),
        async {
            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(BrokerStub::expect_publish(stub.recv_packet().await));
            }
            seen
        }
    );

    // Initial send plus three retries, then a timeout failure.
    let err = publish_result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    assert!(!wire_publishes[0].dup());
    let packet_id = wire_publishes[0].packet_id();
    for retry in &wire_publishes[1..] {
        assert!(retry.dup(), "retransmissions must carry DUP");
        assert_eq!(retry.packet_id(), packet_id);
        assert_eq!(retry.message(), b"payload");
    }
    assert!(stub.try_recv_packet(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_qos2_four_step_handshake() {
    let (options, mut accept_rx) = memory_options();
    let (client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (publish_result, _) = tokio::join!(
        client.publish("exact/once", QoS::ExactOnce, false, b"x"),
        async {
            let publish = BrokerStub::expect_publish(stub.recv_packet().await);
            assert_eq!(publish.qos(), QoS::ExactOnce);
            let packet_id = publish.packet_id();

            stub.send(PublishReceivedPacket::new(packet_id)).await;
            let MqttPacket::PublishRelease(rel) = stub.recv_packet().await else {
                panic!("expected PUBREL after PUBREC");
            };
            assert_eq!(rel.packet_id(), packet_id);

            // A repeated PUBREC must provoke another PUBREL, never a
            // second PUBLISH.
            stub.send(PublishReceivedPacket::new(packet_id)).await;
            let MqttPacket::PublishRelease(rel) = stub.recv_packet().await else {
                panic!("expected a repeated PUBREL");
            };
            assert_eq!(rel.packet_id(), packet_id);

            stub.send(PublishCompletePacket::new(packet_id)).await;
        }
    );
    assert_ok!(publish_result);
}

#[tokio::test]
async fn test_inbound_qos2_dedup() {
    let (options, mut accept_rx) = memory_options();
    let (mut client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let mut duplicated = PublishPacket::new("dup/topic", QoS::ExactOnce, b"only-once").unwrap();
    duplicated.set_packet_id(PacketId::new(7));

    stub.send(duplicated.clone()).await;
    stub.send(duplicated).await;

    // Both deliveries are acknowledged with a PUBREC for the same id.
    for _ in 0..2 {
        match stub.recv_packet().await {
            MqttPacket::PublishReceived(rec) => assert_eq!(rec.packet_id(), PacketId::new(7)),
            other => panic!("expected PUBREC, got {other:?}"),
        }
    }

    // But the application sees the payload exactly once.
    let message = timeout(STEP, client.next_message())
        .await
        .expect("no message delivered")
        .expect("message stream ended");
    assert_eq!(message.message(), b"only-once");
    assert!(timeout(Duration::from_millis(300), client.next_message())
        .await
        .is_err());

    // The release step is still answered.
    stub.send(PublishReleasePacket::new(PacketId::new(7))).await;
    match stub.recv_packet().await {
        MqttPacket::PublishComplete(comp) => assert_eq!(comp.packet_id(), PacketId::new(7)),
        other => panic!("expected PUBCOMP, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions() {
    let (mut options, mut accept_rx) = memory_options();
    options.set_max_reconnect_attempts(3);
    let (mut client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (subscribe_result, _) = tokio::join!(client.subscribe("a/b", QoS::AtLeastOnce), async {
        let subscribe = BrokerStub::expect_subscribe(stub.recv_packet().await);
        assert_eq!(subscribe.topics().len(), 1);
        assert_eq!(subscribe.topics()[0].topic(), "a/b");
        stub.send(SubscribeAckPacket::new(
            SubscribeAck::QoS1,
            subscribe.packet_id(),
        ))
        .await;
    });
    assert_ok!(subscribe_result);

    // The broker drops the TCP connection.
    drop(stub);

    // The client must come back with CONNECT and one SUBSCRIBE carrying
    // the saved filter.
    let mut stub = BrokerStub::accept(&mut accept_rx).await;
    stub.handshake().await;
    let replay = BrokerStub::expect_subscribe(stub.recv_packet().await);
    assert_eq!(replay.topics().len(), 1);
    assert_eq!(replay.topics()[0].topic(), "a/b");
    assert_eq!(replay.topics()[0].qos(), QoS::AtLeastOnce);
    stub.send(SubscribeAckPacket::new(
        SubscribeAck::QoS1,
        replay.packet_id(),
    ))
    .await;

    // A publish over the fresh connection reaches the consumer.
    stub.send(PublishPacket::new("a/b", QoS::AtMostOnce, b"post-reconnect").unwrap())
        .await;
    let message = timeout(STEP, client.next_message())
        .await
        .expect("no message after reconnect")
        .expect("message stream ended");
    assert_eq!(message.topic(), "a/b");
    assert_eq!(message.message(), b"post-reconnect");
}

#[tokio::test]
async fn test_keep_alive_timeout_terminates_without_budget() {
    let (mut options, mut accept_rx) = memory_options();
    options
        .set_keep_alive(Duration::from_secs(1))
        .set_max_reconnect_attempts(0);

    let mut client = AsyncClient::new(options);
    let (connect_result, mut stub) = tokio::join!(client.connect(), async {
        let mut stub = BrokerStub::accept(&mut accept_rx).await;
        let connect = stub.handshake().await;
        assert_eq!(connect.keep_alive(), 1);
        stub
    });
    assert_ok!(connect_result);

    // Swallow ping requests without ever answering.
    let silent_server = tokio::spawn(async move {
        loop {
            match stub.try_recv_packet(STEP).await {
                Some(MqttPacket::PingRequest(_)) => {}
                Some(other) => panic!("unexpected packet while silent: {other:?}"),
                None => return,
            }
        }
    });

    // Within two keep-alive windows the failure detector must fire and,
    // with no reconnect budget, terminate the session.
    let reason = timeout(Duration::from_secs(2), client.when_terminated())
        .await
        .expect("keep-alive timeout never fired");
    assert_eq!(reason, DisconnectReason::KeepAliveTimeout);

    // The message sequence is finite after shutdown.
    assert!(client.next_message().await.is_none());
    silent_server.abort();
}

#[tokio::test]
async fn test_graceful_disconnect() {
    let (options, mut accept_rx) = memory_options();
    let (mut client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (_, disconnect_seen) = tokio::join!(client.disconnect(), async {
        matches!(stub.recv_packet().await, MqttPacket::Disconnect(_))
    });
    assert!(disconnect_seen, "DISCONNECT must reach the wire");

    assert_eq!(client.when_terminated().await, DisconnectReason::NormalDisconnection);
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(client.next_message().await.is_none());

    // Fail fast from now on.
    assert!(client
        .publish("t", QoS::AtMostOnce, false, b"late")
        .await
        .is_err());
    assert!(client.subscribe("t", QoS::AtMostOnce).await.is_err());
}

#[tokio::test]
async fn test_subscribe_rejected_by_server() {
    let (options, mut accept_rx) = memory_options();
    let (client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (subscribe_result, _) = tokio::join!(client.subscribe("denied", QoS::AtLeastOnce), async {
        let subscribe = BrokerStub::expect_subscribe(stub.recv_packet().await);
        stub.send(SubscribeAckPacket::new(
            SubscribeAck::Failed,
            subscribe.packet_id(),
        ))
        .await;
    });
    let err = subscribe_result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
}

#[tokio::test]
async fn test_unsubscribe_round_trip() {
    let (options, mut accept_rx) = memory_options();
    let (client, mut stub) = connected_pair(options, &mut accept_rx).await;

    let (unsubscribe_result, _) = tokio::join!(client.unsubscribe(&["a/b"]), async {
        let MqttPacket::Unsubscribe(unsubscribe) = stub.recv_packet().await else {
            panic!("expected UNSUBSCRIBE");
        };
        stub.send(UnsubscribeAckPacket::new(unsubscribe.packet_id()))
            .await;
    });
    assert_ok!(unsubscribe_result);
}

#[tokio::test]
async fn test_connect_refused_by_server() {
    let (options, mut accept_rx) = memory_options();
    let mut client = AsyncClient::new(options);

    let (connect_result, _) = tokio::join!(client.connect(), async {
        let mut stub = BrokerStub::accept(&mut accept_rx).await;
        let MqttPacket::Connect(_connect) = stub.recv_packet().await else {
            panic!("expected CONNECT");
        };
        stub.send(ConnectAckPacket::new(
            false,
            ConnectReturnCode::Unauthorized,
        ))
        .await;
        // Keep the stub alive until the client gives up on it.
        let _ = stub.try_recv_packet(Duration::from_millis(300)).await;
    });

    let err = connect_result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
    assert_eq!(client.status(), ConnectionStatus::Failed);
}
