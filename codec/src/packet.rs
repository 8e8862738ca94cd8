// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket, DisconnectPacket,
    EncodeError, EncodePacket, Packet, PacketType, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket, VarIntError,
};

/// Tagged union over the fourteen control packet kinds.
///
/// The streaming pipeline moves values of this type between stages; the
/// per-packet structs stay the unit of encode/decode logic.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl MqttPacket {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(p) => p.packet_type(),
            Self::ConnectAck(p) => p.packet_type(),
            Self::Publish(p) => p.packet_type(),
            Self::PublishAck(p) => p.packet_type(),
            Self::PublishReceived(p) => p.packet_type(),
            Self::PublishRelease(p) => p.packet_type(),
            Self::PublishComplete(p) => p.packet_type(),
            Self::Subscribe(p) => p.packet_type(),
            Self::SubscribeAck(p) => p.packet_type(),
            Self::Unsubscribe(p) => p.packet_type(),
            Self::UnsubscribeAck(p) => p.packet_type(),
            Self::PingRequest(p) => p.packet_type(),
            Self::PingResponse(p) => p.packet_type(),
            Self::Disconnect(p) => p.packet_type(),
        }
    }

    /// Get exact byte length of the encoded packet.
    ///
    /// # Errors
    ///
    /// Returns error if packet size exceeds the protocol limit.
    pub fn bytes(&self) -> Result<usize, VarIntError> {
        match self {
            Self::Connect(p) => p.bytes(),
            Self::ConnectAck(p) => p.bytes(),
            Self::Publish(p) => p.bytes(),
            Self::PublishAck(p) => p.bytes(),
            Self::PublishReceived(p) => p.bytes(),
            Self::PublishRelease(p) => p.bytes(),
            Self::PublishComplete(p) => p.bytes(),
            Self::Subscribe(p) => p.bytes(),
            Self::SubscribeAck(p) => p.bytes(),
            Self::Unsubscribe(p) => p.bytes(),
            Self::UnsubscribeAck(p) => p.bytes(),
            Self::PingRequest(p) => p.bytes(),
            Self::PingResponse(p) => p.bytes(),
            Self::Disconnect(p) => p.bytes(),
        }
    }

    /// Dispatch on the control type nibble and run the matching decoder
    /// over a complete packet frame.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a valid packet of its announced
    /// type.
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_type = PacketType::try_from(ba.peek_byte()?)?;
        match packet_type {
            PacketType::Connect => ConnectPacket::decode(ba).map(Self::Connect),
            PacketType::ConnectAck => ConnectAckPacket::decode(ba).map(Self::ConnectAck),
            PacketType::Publish { .. } => PublishPacket::decode(ba).map(Self::Publish),
            PacketType::PublishAck => PublishAckPacket::decode(ba).map(Self::PublishAck),
            PacketType::PublishReceived => {
                PublishReceivedPacket::decode(ba).map(Self::PublishReceived)
            }
            PacketType::PublishRelease => {
                PublishReleasePacket::decode(ba).map(Self::PublishRelease)
            }
            PacketType::PublishComplete => {
                PublishCompletePacket::decode(ba).map(Self::PublishComplete)
            }
            PacketType::Subscribe => SubscribePacket::decode(ba).map(Self::Subscribe),
            PacketType::SubscribeAck => SubscribeAckPacket::decode(ba).map(Self::SubscribeAck),
            PacketType::Unsubscribe => UnsubscribePacket::decode(ba).map(Self::Unsubscribe),
            PacketType::UnsubscribeAck => {
                UnsubscribeAckPacket::decode(ba).map(Self::UnsubscribeAck)
            }
            PacketType::PingRequest => PingRequestPacket::decode(ba).map(Self::PingRequest),
            PacketType::PingResponse => PingResponsePacket::decode(ba).map(Self::PingResponse),
            PacketType::Disconnect => DisconnectPacket::decode(ba).map(Self::Disconnect),
        }
    }
}

impl EncodePacket for MqttPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PublishAck(p) => p.encode(buf),
            Self::PublishReceived(p) => p.encode(buf),
            Self::PublishRelease(p) => p.encode(buf),
            Self::PublishComplete(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
        }
    }
}

impl From<PublishPacket> for MqttPacket {
    fn from(p: PublishPacket) -> Self {
        Self::Publish(p)
    }
}

impl From<PublishAckPacket> for MqttPacket {
    fn from(p: PublishAckPacket) -> Self {
        Self::PublishAck(p)
    }
}

impl From<PublishReceivedPacket> for MqttPacket {
    fn from(p: PublishReceivedPacket) -> Self {
        Self::PublishReceived(p)
    }
}

impl From<PublishReleasePacket> for MqttPacket {
    fn from(p: PublishReleasePacket) -> Self {
        Self::PublishRelease(p)
    }
}

impl From<PublishCompletePacket> for MqttPacket {
    fn from(p: PublishCompletePacket) -> Self {
        Self::PublishComplete(p)
    }
}

impl From<SubscribePacket> for MqttPacket {
    fn from(p: SubscribePacket) -> Self {
        Self::Subscribe(p)
    }
}

impl From<UnsubscribePacket> for MqttPacket {
    fn from(p: UnsubscribePacket) -> Self {
        Self::Unsubscribe(p)
    }
}

impl From<ConnectPacket> for MqttPacket {
    fn from(p: ConnectPacket) -> Self {
        Self::Connect(p)
    }
}

impl From<PingRequestPacket> for MqttPacket {
    fn from(p: PingRequestPacket) -> Self {
        Self::PingRequest(p)
    }
}

impl From<DisconnectPacket> for MqttPacket {
    fn from(p: DisconnectPacket) -> Self {
        Self::Disconnect(p)
    }
}

/// Encode `packets` back to back into `buf`.
///
/// Returns total bytes written. Packets are never interleaved; the byte
/// range of each packet is exactly the range one `encode()` call produced.
///
/// # Errors
///
/// Returns error if any packet fails to encode, or if the written byte
/// count disagrees with the size the estimator predicted.
pub fn encode_packets(packets: &[MqttPacket], buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
    let old_len = buf.len();
    let mut predicted = 0;
    for packet in packets {
        predicted += packet.bytes()?;
        packet.encode(buf)?;
    }

    let written = buf.len() - old_len;
    if written != predicted {
        log::error!("encode_packets: predicted {predicted} bytes, wrote {written}");
        return Err(EncodeError::SizeMismatch);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketId, QoS};

    #[test]
    fn test_decode_dispatch() {
        let mut buf = Vec::new();
        PublishAckPacket::new(PacketId::new(3)).encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let packet = MqttPacket::decode(&mut ba).unwrap();
        assert_eq!(
            packet,
            MqttPacket::PublishAck(PublishAckPacket::new(PacketId::new(3)))
        );
    }

    #[test]
    fn test_encode_packets_back_to_back() {
        let mut publish = PublishPacket::new("t", QoS::AtLeastOnce, b"abc").unwrap();
        publish.set_packet_id(PacketId::new(1));
        let packets = vec![
            MqttPacket::Publish(publish),
            MqttPacket::PingRequest(PingRequestPacket::new()),
        ];

        let mut buf = Vec::new();
        let written = encode_packets(&packets, &mut buf).unwrap();
        assert_eq!(written, buf.len());

        let expected: usize = packets.iter().map(|p| p.bytes().unwrap()).sum();
        assert_eq!(written, expected);
    }
}
