// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use codec::{encode_packets, MqttPacket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::byte_channel::PipeWriter;
use crate::commands::EncoderCmd;

/// Serializes outbound packets into framed byte blocks.
///
/// The stage outlives individual connections: it keeps reading the stable
/// outbound queue and a control channel tells it which pipe to write into
/// after a transport swap. While no sink is installed, packets simply wait
/// in the queue.
///
/// Packets are coalesced greedily: whatever is immediately available is
/// encoded into one block as long as the predicted sizes sum up to at most
/// `max_frame_size`. A single packet predicted above `max_packet_size` is
/// dropped with a warning; the stream itself never fails over it.
pub struct EncoderStage {
    outbound_rx: mpsc::Receiver<MqttPacket>,
    ctrl_rx: mpsc::Receiver<EncoderCmd>,
    sink: Option<PipeWriter>,

    /// First packet of the next batch when the current one is full.
    carry: Option<MqttPacket>,

    max_frame_size: usize,
    max_packet_size: usize,
}

impl EncoderStage {
    pub fn spawn(
        outbound_rx: mpsc::Receiver<MqttPacket>,
        ctrl_rx: mpsc::Receiver<EncoderCmd>,
        max_frame_size: usize,
        max_packet_size: usize,
    ) -> JoinHandle<()> {
        let stage = Self {
            outbound_rx,
            ctrl_rx,
            sink: None,
            carry: None,
            max_frame_size,
            max_packet_size,
        };
        tokio::spawn(stage.run())
    }

    async fn run(mut self) {
        loop {
            if self.sink.is_some() {
                if let Some(first) = self.carry.take() {
                    self.write_batch(first).await;
                    continue;
                }
            }

            tokio::select! {
                maybe_cmd = self.ctrl_rx.recv() => match maybe_cmd {
                    Some(EncoderCmd::SwapSink { writer, installed }) => {
                        self.discard_stale();
                        self.sink = Some(writer);
                        log::debug!("encoder: sink swapped");
                        let _ = installed.send(());
                    }
                    Some(EncoderCmd::Flush(done)) => {
                        self.drain_queued().await;
                        let _ = done.send(());
                    }
                    Some(EncoderCmd::Halt) | None => break,
                },
                maybe_packet = self.outbound_rx.recv(), if self.sink.is_some() => {
                    match maybe_packet {
                        Some(packet) => self.write_batch(packet).await,
                        None => break,
                    }
                },
            }
        }
    }

    /// Throw away packets queued for a connection that no longer exists.
    /// Retransmissions come back through their engines; the first packet
    /// of the new connection must be its CONNECT.
    fn discard_stale(&mut self) {
        let mut dropped = usize::from(self.carry.take().is_some());
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("encoder: {dropped} stale packets discarded on swap");
        }
    }

    /// Push everything already sitting in the outbound queue through the
    /// sink, used right before a graceful close.
    async fn drain_queued(&mut self) {
        if let Some(first) = self.carry.take() {
            self.write_batch(first).await;
        }
        while self.sink.is_some() {
            match self.outbound_rx.try_recv() {
                Ok(packet) => self.write_batch(packet).await,
                Err(_empty) => break,
            }
        }
    }

    /// Admit `packet`, pull whatever else is ready, encode one frame.
    async fn write_batch(&mut self, packet: MqttPacket) {
        let mut batch: Vec<MqttPacket> = Vec::new();
        let mut total = 0;
        let mut candidate = Some(packet);

        loop {
            let packet = match candidate.take() {
                Some(packet) => packet,
                None => match self.outbound_rx.try_recv() {
                    Ok(packet) => packet,
                    Err(_empty) => break,
                },
            };

            let size = match packet.bytes() {
                Ok(size) => size,
                Err(err) => {
                    log::warn!("encoder: unencodable packet dropped: {err:?}");
                    continue;
                }
            };
            if size > self.max_packet_size {
                log::warn!(
                    "encoder: packet of {size} bytes exceeds limit {}, dropped",
                    self.max_packet_size
                );
                continue;
            }

            if !batch.is_empty() && total + size > self.max_frame_size {
                self.carry = Some(packet);
                break;
            }
            total += size;
            batch.push(packet);
            if total >= self.max_frame_size {
                break;
            }
        }

        if batch.is_empty() {
            return;
        }

        let mut buf = Vec::with_capacity(total);
        match encode_packets(&batch, &mut buf) {
            Ok(_written) => {
                let delivered = match &self.sink {
                    Some(sink) => sink.write(Bytes::from(buf)).await.is_ok(),
                    None => false,
                };
                if !delivered {
                    log::warn!("encoder: sink gone, frame of {} packets dropped", batch.len());
                    self.sink = None;
                }
            }
            Err(err) => {
                // Codec integrity failure; drop the batch rather than the
                // whole stream.
                log::error!("encoder: failed to encode batch: {err:?}");
            }
        }
    }
}
