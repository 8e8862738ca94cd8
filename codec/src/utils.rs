// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// String is longer than the two byte length prefix allows.
    TooManyData,

    /// Ill-formed UTF-8 or an embedded NUL character.
    InvalidChar,
}

/// Check that `s` may be sent as an MQTT UTF-8 string.
///
/// The character data MUST NOT include the null character U+0000
/// [MQTT-1.5.3-2].
///
/// # Errors
///
/// Returns error if `s` is too long or contains NUL.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        return Err(StringError::TooManyData);
    }
    if s.contains('\u{0}') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

/// Convert raw bytes into a validated MQTT string.
///
/// # Errors
///
/// Returns error if bytes are not well-formed UTF-8 or contain NUL.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_err| StringError::InvalidChar)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// Check that a binary field fits its two byte length prefix.
///
/// # Errors
///
/// Returns error if `data` is longer than 65535 bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), StringError> {
    if data.len() > u16::MAX as usize {
        Err(StringError::TooManyData)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Longer than 23 characters.
    TooLong,

    /// Contains characters outside of `0-9a-zA-Z`.
    InvalidChars,
}

/// Check client id against the character set the specification recommends.
///
/// The Server MUST allow ClientIds which are between 1 and 23 UTF-8 encoded
/// bytes in length, and that contain only the characters
/// "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ"
/// [MQTT-3.1.3-5]. An empty client id is accepted and asks the server to
/// assign one.
///
/// # Errors
///
/// Returns error if `client_id` is too long or contains other characters.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > 23 {
        return Err(ClientIdError::TooLong);
    }
    if client_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ClientIdError::InvalidChars)
    }
}

/// Generate a random client id of `len` alphanumeric characters.
#[must_use]
pub fn random_client_id(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("").is_ok());
        assert!(validate_client_id("device42").is_ok());
        assert!(validate_client_id("ABCDEFGHIJKLMNOPQRSTUVW").is_ok());
        assert!(validate_client_id("ABCDEFGHIJKLMNOPQRSTUVWX").is_err());
        assert!(validate_client_id("has space").is_err());
        assert!(validate_client_id("has/slash").is_err());
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id(12);
        assert_eq!(id.len(), 12);
        assert!(validate_client_id(&id).is_ok());
    }

    #[test]
    fn test_utf8_string_rejects_nul() {
        assert!(validate_utf8_string("a\u{0}b").is_err());
        assert!(to_utf8_string(&[0x61, 0x00, 0x62]).is_err());
    }
}
