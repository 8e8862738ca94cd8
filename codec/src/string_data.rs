// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::io::Write;

use crate::utils::{validate_utf8_string, StringError};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// UTF-8 string field with a two byte length prefix.
///
/// Length is limited to the range of 0 to 65535 bytes and the character
/// data MUST be well-formed UTF-8 without U+0000 [MQTT-1.5.3].
///
/// ```txt
/// +-------------------+
/// | String Length     |
/// |                   |
/// +-------------------+
/// | String bytes ...  |
/// +-------------------+
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringData(String);

impl StringData {
    /// Create an empty string data.
    #[must_use]
    pub const fn new() -> Self {
        Self(String::new())
    }

    /// Convert string slice into string data.
    ///
    /// # Errors
    ///
    /// Returns error if `s` is too long or contains NUL.
    pub fn from(s: &str) -> Result<Self, StringError> {
        validate_utf8_string(s)?;
        Ok(Self(s.to_string()))
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

impl fmt::Display for StringData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StringData {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for StringData {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()? as usize;
        let s = ba.read_string(len)?;
        Ok(Self(s))
    }
}

impl EncodePacket for StringData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}
