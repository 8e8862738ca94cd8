// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::utils::validate_two_bytes_data;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Opaque byte field with a two byte length prefix.
///
/// Length is limited to the range of 0 to 65535 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryData(Vec<u8>);

impl BinaryData {
    /// Create an empty binary data.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Convert byte slice into binary data.
    ///
    /// # Errors
    ///
    /// Returns error if `data` is longer than 65535 bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, EncodeError> {
        validate_two_bytes_data(data)?;
        Ok(Self(data.to_vec()))
    }

    /// Get byte length in packet, length prefix included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for BinaryData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DecodePacket for BinaryData {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()? as usize;
        let data = ba.read_bytes(len)?;
        Ok(Self(data.to_vec()))
    }
}

impl EncodePacket for BinaryData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(&self.0)?;
        Ok(self.bytes())
    }
}
