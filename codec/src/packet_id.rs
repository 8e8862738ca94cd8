// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Two byte packet identifier.
///
/// SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0) control
/// packets MUST contain a non-zero 16-bit packet identifier [MQTT-2.3.1-1].
/// The all-zero value only exists in memory as the placeholder of a QoS 0
/// publish and is never written to the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PacketId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        if value == 0 {
            return Err(DecodeError::InvalidPacketId);
        }
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_rejected_on_the_wire() {
        let buf = [0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba), Err(DecodeError::InvalidPacketId));
    }

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        PacketId::new(0x1234).encode(&mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34]);
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba).unwrap(), PacketId::new(0x1234));
    }
}
