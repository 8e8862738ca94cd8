// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::{Buf, BytesMut};
use std::fmt;

use crate::{ByteArray, DecodeError, MqttPacket};

/// Decode failure annotated with the frame the decoder was working on.
///
/// `predicted_bytes` is the total packet size announced by the fixed
/// header, zero when the length prefix itself was malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameError {
    /// Raw first byte of the offending frame, type nibble plus flags.
    pub type_byte: u8,

    /// Predicted total size of the frame, fixed header included.
    pub predicted_bytes: usize,

    pub cause: DecodeError,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed frame, first byte {:#04x}, predicted {} bytes: {}",
            self.type_byte, self.predicted_bytes, self.cause
        )
    }
}

impl std::error::Error for FrameError {}

/// Reassemble control packets from a chunked byte stream.
///
/// The transport delivers reads in arbitrary slices: a chunk may hold a
/// partial packet, several packets, or both. Complete frames are drained
/// in order, tail bytes stay buffered until the next chunk arrives.
///
/// Every decoded packet owns its buffers; no packet borrows from the
/// receive buffer once it leaves this type.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

/// Result of scanning the buffered bytes for one frame boundary.
enum FrameScan {
    /// Not enough bytes yet, keep everything as residual.
    Incomplete,

    /// A complete frame of `total` bytes starts at the buffer head.
    Complete { total: usize },

    /// The length prefix is malformed beyond recovery.
    Malformed(DecodeError),
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a freshly read chunk to the residual buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Get number of residual bytes waiting for the rest of their frame.
    #[must_use]
    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes, used when the connection is torn down.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drain every complete frame from the buffer, in arrival order.
    ///
    /// An empty vector means no complete packet is available yet.
    ///
    /// # Errors
    ///
    /// Returns error if a frame is malformed; the buffer is left as-is and
    /// the session is expected to terminate the connection.
    pub fn decode_packets(&mut self) -> Result<Vec<MqttPacket>, FrameError> {
        let mut packets = Vec::new();

        loop {
            let total = match Self::scan_frame(&self.buf) {
                FrameScan::Incomplete => break,
                FrameScan::Complete { total } => total,
                FrameScan::Malformed(cause) => {
                    return Err(FrameError {
                        type_byte: self.buf[0],
                        predicted_bytes: 0,
                        cause,
                    });
                }
            };

            let frame = self.buf.copy_to_bytes(total);
            let mut ba = ByteArray::new(&frame);
            let packet = MqttPacket::decode(&mut ba).map_err(|cause| FrameError {
                type_byte: frame[0],
                predicted_bytes: total,
                cause,
            })?;
            packets.push(packet);
        }

        Ok(packets)
    }

    /// Find the boundary of the frame at the buffer head.
    ///
    /// `header_length = 1 + vbi_bytes`; the frame is complete once
    /// `header_length + remaining_length` bytes are present.
    fn scan_frame(buf: &[u8]) -> FrameScan {
        if buf.is_empty() {
            return FrameScan::Incomplete;
        }

        let mut remaining: usize = 0;
        let mut multiplier: usize = 1;
        let mut vbi_bytes = 0;
        loop {
            if vbi_bytes == 4 {
                return FrameScan::Malformed(DecodeError::InvalidVarInt);
            }
            let Some(&byte) = buf.get(1 + vbi_bytes) else {
                // The length prefix itself is still incomplete.
                return FrameScan::Incomplete;
            };
            vbi_bytes += 1;
            remaining += (byte as usize & 0x7f) * multiplier;
            multiplier *= 128;
            if byte & 0x80 == 0 {
                break;
            }
        }

        let total = 1 + vbi_bytes + remaining;
        if buf.len() < total {
            FrameScan::Incomplete
        } else {
            FrameScan::Complete { total }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encode_packets, EncodePacket, PacketId, PingResponsePacket, PublishAckPacket,
        PublishPacket, QoS,
    };

    fn sample_packets() -> Vec<MqttPacket> {
        let mut p1 = PublishPacket::new("alpha/1", QoS::AtLeastOnce, b"payload-1").unwrap();
        p1.set_packet_id(PacketId::new(1));
        let p2 = PublishPacket::new("alpha/2", QoS::AtMostOnce, b"").unwrap();
        vec![
            MqttPacket::Publish(p1),
            MqttPacket::PingResponse(PingResponsePacket::new()),
            MqttPacket::Publish(p2),
            MqttPacket::PublishAck(PublishAckPacket::new(PacketId::new(1))),
        ]
    }

    #[test]
    fn test_whole_stream_at_once() {
        let packets = sample_packets();
        let mut wire = Vec::new();
        encode_packets(&packets, &mut wire).unwrap();

        let mut decoder = StreamDecoder::new();
        decoder.extend(&wire);
        let decoded = decoder.decode_packets().unwrap();
        assert_eq!(decoded, packets);
        assert_eq!(decoder.residual_len(), 0);
    }

    #[test]
    fn test_any_partition_reassembles() {
        let packets = sample_packets();
        let mut wire = Vec::new();
        encode_packets(&packets, &mut wire).unwrap();

        // Every chunk size from single bytes up to the full stream.
        for chunk_size in 1..=wire.len() {
            let mut decoder = StreamDecoder::new();
            let mut decoded = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.extend(chunk);
                decoded.extend(decoder.decode_packets().unwrap());
            }
            assert_eq!(decoded, packets, "chunk size {chunk_size}");
            assert_eq!(decoder.residual_len(), 0);
        }
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut publish = PublishPacket::new("t", QoS::AtLeastOnce, b"abc").unwrap();
        publish.set_packet_id(PacketId::new(2));
        let mut wire = Vec::new();
        publish.encode(&mut wire).unwrap();

        let mut decoder = StreamDecoder::new();
        decoder.extend(&wire[..wire.len() - 1]);
        assert!(decoder.decode_packets().unwrap().is_empty());
        assert_eq!(decoder.residual_len(), wire.len() - 1);

        decoder.extend(&wire[wire.len() - 1..]);
        let decoded = decoder.decode_packets().unwrap();
        assert_eq!(decoded, vec![MqttPacket::Publish(publish)]);
    }

    #[test]
    fn test_malformed_length_prefix() {
        let mut decoder = StreamDecoder::new();
        decoder.extend(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x01]);
        let err = decoder.decode_packets().unwrap_err();
        assert_eq!(err.cause, DecodeError::InvalidVarInt);
        assert_eq!(err.type_byte, 0x30);
    }

    #[test]
    fn test_malformed_body_reports_prediction() {
        // SUBSCRIBE frame with an empty filter list.
        let mut decoder = StreamDecoder::new();
        decoder.extend(&[0x82, 0x02, 0x00, 0x01]);
        let err = decoder.decode_packets().unwrap_err();
        assert_eq!(err.predicted_bytes, 4);
        assert_eq!(err.cause, DecodeError::EmptyTopicFilter);
    }
}
