// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{MqttPacket, StreamDecoder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::byte_channel::PipeReader;
use crate::commands::SessionEvent;

/// Turns the inbound byte pipe into a stream of typed packets.
///
/// One instance runs per connection. Partial frames survive across reads
/// inside the stream decoder; backpressure from the routing stage is
/// honoured by the bounded packet channel, so no more bytes are pulled
/// from the pipe than the downstream can accept.
pub struct DecoderStage {
    reader: PipeReader,
    packet_tx: mpsc::Sender<MqttPacket>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl DecoderStage {
    pub fn spawn(
        reader: PipeReader,
        packet_tx: mpsc::Sender<MqttPacket>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> JoinHandle<()> {
        let stage = Self {
            reader,
            packet_tx,
            events_tx,
        };
        tokio::spawn(stage.run())
    }

    async fn run(self) {
        let mut decoder = StreamDecoder::new();

        while let Some(chunk) = self.reader.read().await {
            decoder.extend(&chunk);
            match decoder.decode_packets() {
                Ok(packets) => {
                    for packet in packets {
                        if self.packet_tx.send(packet).await.is_err() {
                            // Downstream completed; propagate upstream.
                            self.reader.close();
                            return;
                        }
                    }
                }
                Err(err) => {
                    log::error!("decoder: {err}");
                    let _ = self
                        .events_tx
                        .send(SessionEvent::ProtocolViolation(err.to_string()))
                        .await;
                    self.reader.close();
                    return;
                }
            }
        }

        log::debug!(
            "decoder: inbound pipe completed, {} residual bytes",
            decoder.residual_len()
        );
    }
}
