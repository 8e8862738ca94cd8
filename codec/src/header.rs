// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt, VarIntError};

/// Control packet type, the high nibble of the first byte.
///
/// Publish carries its flag bits inline since they change the shape of the
/// packet; every other type has a fixed flag nibble.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to server.
    #[default]
    Connect,

    /// Server reply to connect request.
    ConnectAck,

    /// Publish message.
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement, QoS 1 reply.
    PublishAck,

    /// Publish received, first QoS 2 reply.
    PublishReceived,

    /// Publish release, second QoS 2 step.
    PublishRelease,

    /// Publish complete, final QoS 2 step.
    PublishComplete,

    /// Client subscribe request.
    Subscribe,

    /// Subscribe acknowledgement.
    SubscribeAck,

    /// Unsubscribe request.
    Unsubscribe,

    /// Unsubscribe acknowledgement.
    UnsubscribeAck,

    /// Client ping request.
    PingRequest,

    /// Server ping response.
    PingResponse,

    /// Either side is closing the session.
    Disconnect,
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits: u8 = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        };

        let flag_bits: u8 = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0 };
                let qos = (qos as u8) << 1;
                let retain = u8::from(retain);
                dup | qos | retain
            }
            // Bits 3,2,1 and 0 of the fixed header of PUBREL, SUBSCRIBE and
            // UNSUBSCRIBE are reserved and MUST be set to 0,0,1,0
            // [MQTT-3.6.1-1], [MQTT-3.8.1-1], [MQTT-3.10.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0,
        };

        (type_bits << 4) | flag_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type and flags from the first packet byte.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacketType` for nibbles 0 and 15 and
    /// `InvalidPacketFlags` if reserved flag bits do not match
    /// [MQTT-2.2.2-2].
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        if type_bits == 3 {
            let dup = flag & 0b0000_1000 != 0;
            let retain = flag & 0b0000_0001 != 0;
            let qos = QoS::try_from((flag & 0b0000_0110) >> 1)
                .map_err(|_err| DecodeError::InvalidPacketFlags)?;
            // The DUP flag MUST be set to 0 for all QoS 0 messages
            // [MQTT-3.3.1-2].
            if dup && qos == QoS::AtMostOnce {
                return Err(DecodeError::InvalidPacketFlags);
            }
            return Ok(Self::Publish { dup, qos, retain });
        }

        let (packet_type, expected_flag) = match type_bits {
            1 => (Self::Connect, 0),
            2 => (Self::ConnectAck, 0),
            4 => (Self::PublishAck, 0),
            5 => (Self::PublishReceived, 0),
            6 => (Self::PublishRelease, 0b0000_0010),
            7 => (Self::PublishComplete, 0),
            8 => (Self::Subscribe, 0b0000_0010),
            9 => (Self::SubscribeAck, 0),
            10 => (Self::Unsubscribe, 0b0000_0010),
            11 => (Self::UnsubscribeAck, 0),
            12 => (Self::PingRequest, 0),
            13 => (Self::PingResponse, 0),
            14 => (Self::Disconnect, 0),
            t => {
                log::error!("header: invalid type bits: {t:#b}");
                return Err(DecodeError::InvalidPacketType);
            }
        };

        if flag == expected_flag {
            Ok(packet_type)
        } else {
            log::error!("header: invalid flag {flag:#b} for {packet_type:?}");
            Err(DecodeError::InvalidPacketFlags)
        }
    }
}

/// Fixed header part of a control packet.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// Number of bytes in the packet after the fixed header itself,
    /// in variable length encoding, 1 to 4 bytes.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` does not fit in four VBI bytes.
    pub const fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = match VarInt::from(remaining_length) {
            Ok(v) => v,
            Err(err) => return Err(err),
        };
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.packet_type.into());
        let len_bytes = self.remaining_length.encode(buf)?;
        Ok(PacketType::bytes() + len_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut buf = Vec::new();
        let fixed_header = FixedHeader::new(PacketType::PingRequest, 0).unwrap();
        assert_eq!(fixed_header.encode(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0xc0, 0x00]);
    }

    #[test]
    fn test_decode_publish() {
        let buf = [0x3d, 0x13];
        let mut ba = ByteArray::new(&buf);
        let fixed_header = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            fixed_header.packet_type(),
            PacketType::Publish {
                dup: true,
                qos: QoS::ExactOnce,
                retain: true,
            }
        );
        assert_eq!(fixed_header.remaining_length(), 19);
    }

    #[test]
    fn test_decode_rejects_bad_flags() {
        // SUBSCRIBE with reserved flags 0b0000.
        let buf = [0x80, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_decode_rejects_dup_on_qos0() {
        let buf = [0x38, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }
}
