// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::io::Write;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, PubTopic, QoS, VarIntError,
};

/// Application message, sent in either direction.
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name            |
/// |                       |
/// +-----------------------+
/// | Packet Identifier     |
/// | (only when QoS > 0)   |
/// +-----------------------+
/// | Payload ...           |
/// +-----------------------+
/// ```
///
/// Expected reply:
/// * QoS 0, none
/// * QoS 1, `PublishAckPacket`
/// * QoS 2, `PublishReceivedPacket`
///
/// The packet is immutable once constructed; a retransmission is a fresh
/// copy produced by [`PublishPacket::dup_copy`] so shared references never
/// observe a flipped DUP bit.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishPacket {
    /// False on the first delivery attempt of this packet id, true on any
    /// re-delivery. MUST be false when QoS is 0 [MQTT-3.3.1-2].
    dup: bool,

    qos: QoS,

    /// Ask the server to keep the message as the retained message of its
    /// topic.
    retain: bool,

    /// Topic name must not contain wildcard characters.
    topic: PubTopic,

    /// Zero placeholder when QoS is 0; never encoded in that case.
    packet_id: PacketId,

    /// Opaque application payload. A zero length payload is valid.
    msg: Bytes,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic,
            packet_id: PacketId::new(0),
            msg: Bytes::copy_from_slice(msg),
        })
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    /// Get a retransmission copy with the DUP flag raised.
    ///
    /// Payload bytes are shared, not cloned.
    #[must_use]
    pub fn dup_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.dup = self.qos != QoS::AtMostOnce;
        copy
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// The packet identifier field is only present when QoS is 1 or 2.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    /// Take the payload without copying it.
    #[must_use]
    pub fn into_message(self) -> Bytes {
        self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.topic.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;

        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        let topic = PubTopic::decode(ba)?;

        // The packet identifier field is only present when QoS is 1 or 2
        // and must be non-zero [MQTT-2.3.1-1].
        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            PacketId::decode(ba)?
        };

        // Payload length is whatever the remaining length leaves after the
        // variable header. A zero length payload is valid.
        let mut header_len = topic.bytes();
        if qos != QoS::AtMostOnce {
            header_len += PacketId::bytes();
        }
        let msg_len = fixed_header
            .remaining_length()
            .checked_sub(header_len)
            .ok_or(DecodeError::InvalidRemainingLength)?;

        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(buf)?;
        }
        buf.write_all(&self.msg)?;

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_qos0() {
        let buf: Vec<u8> = vec![
            0x30, 0x0c, 0x00, 0x07, b'g', b'r', b'e', b't', b'i', b'n', b'g', b'h', b'e', b'l',
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.qos(), QoS::AtMostOnce);
        assert_eq!(packet.topic(), "greting");
        assert_eq!(packet.message(), b"hel");
    }

    #[test]
    fn test_round_trip_qos1() {
        let mut packet = PublishPacket::new("t1", QoS::AtLeastOnce, &[0x01, 0x02, 0x03]).unwrap();
        packet.set_packet_id(PacketId::new(7));
        let mut buf = Vec::new();
        let written = packet.encode(&mut buf).unwrap();
        assert_eq!(written, packet.bytes().unwrap());

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let packet = PublishPacket::new("t/empty", QoS::AtMostOnce, &[]).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert!(decoded.message().is_empty());
    }

    #[test]
    fn test_dup_copy_keeps_qos0_clear() {
        let packet = PublishPacket::new("t", QoS::AtMostOnce, b"x").unwrap();
        assert!(!packet.dup_copy().dup());

        let mut packet = PublishPacket::new("t", QoS::AtLeastOnce, b"x").unwrap();
        packet.set_packet_id(PacketId::new(3));
        let copy = packet.dup_copy();
        assert!(copy.dup());
        assert_eq!(copy.packet_id(), packet.packet_id());
    }

    #[test]
    fn test_dup_qos1_retransmission_accepted() {
        let mut packet = PublishPacket::new("t1", QoS::AtLeastOnce, b"again").unwrap();
        packet.set_packet_id(PacketId::new(9));
        let copy = packet.dup_copy();

        let mut buf = Vec::new();
        copy.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert!(decoded.dup());
        assert_eq!(decoded.packet_id(), PacketId::new(9));
    }
}
