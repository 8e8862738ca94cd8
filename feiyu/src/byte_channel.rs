// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Pick the pause watermark for a given frame size.
///
/// Small frames get a generous fixed budget, large frames scale linearly
/// so a single batch can never fill the whole window.
#[must_use]
pub const fn scale_pause_threshold(max_frame_size: usize) -> usize {
    if max_frame_size <= 128 * 1024 {
        512 * 1024
    } else if max_frame_size <= 1024 * 1024 {
        2 * 1024 * 1024
    } else {
        2 * max_frame_size
    }
}

#[derive(Debug)]
struct PipeState {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,

    /// Set once queued bytes exceed the pause threshold; cleared when the
    /// reader drains below half of it.
    paused: bool,

    closed: bool,
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
    pause_threshold: usize,

    /// The opposite-direction pipe; completing this pipe completes it too.
    sibling: Mutex<Weak<PipeShared>>,
}

impl PipeShared {
    fn new(pause_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                paused: false,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            pause_threshold,
            sibling: Mutex::new(Weak::new()),
        })
    }

    /// Mark the pipe closed and wake both ends.
    fn close_one(&self) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// Close this pipe and its sibling.
    fn close(&self) {
        self.close_one();
        let sibling = match self.sibling.lock() {
            Ok(guard) => guard.upgrade(),
            Err(_) => None,
        };
        if let Some(sibling) = sibling {
            sibling.close_one();
        }
    }
}

/// Detached handle that can complete the whole channel.
///
/// Lets the transport driver finish both directions during cleanup while
/// the pipe endpoints themselves live inside the read/write loops.
#[derive(Debug, Clone)]
pub struct ChannelCloser {
    shared: Arc<PipeShared>,
}

impl ChannelCloser {
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Producing end of one byte pipe. Single producer.
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Queue `data` for the reading side.
    ///
    /// Waits while the pipe is paused by the watermark. Data is enqueued
    /// as one block; blocks are never split or merged.
    ///
    /// # Errors
    ///
    /// Returns the data back if the pipe is already completed.
    pub async fn write(&self, data: Bytes) -> Result<(), Bytes> {
        let mut data = Some(data);
        loop {
            {
                let Ok(mut state) = self.shared.state.lock() else {
                    return Err(data.take().unwrap_or_default());
                };
                if state.closed {
                    return Err(data.take().unwrap_or_default());
                }
                if !state.paused {
                    if let Some(chunk) = data.take() {
                        state.queued_bytes += chunk.len();
                        state.queue.push_back(chunk);
                        if state.queued_bytes > self.shared.pause_threshold {
                            state.paused = true;
                        }
                    }
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// Check whether the watermark currently holds writes back.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.paused)
            .unwrap_or(false)
    }

    /// Complete both directions of the channel.
    pub fn close(&self) {
        self.shared.close();
    }

    #[must_use]
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // A dropped producer completes the pipe so the reader unblocks.
        self.shared.close_one();
    }
}

/// Consuming end of one byte pipe. Single consumer.
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Take the next queued block.
    ///
    /// Returns `None` once the pipe is completed and fully drained.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            {
                let Ok(mut state) = self.shared.state.lock() else {
                    return None;
                };
                if let Some(data) = state.queue.pop_front() {
                    state.queued_bytes -= data.len();
                    if state.paused && state.queued_bytes < self.shared.pause_threshold / 2 {
                        state.paused = false;
                        self.shared.writable.notify_one();
                    }
                    return Some(data);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Complete both directions of the channel.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.close_one();
    }
}

/// Application ends of the channel: outbound producer, inbound consumer.
#[derive(Debug)]
pub struct AppPipes {
    /// Encoder stage writes encoded frames here.
    pub writer: PipeWriter,

    /// Decoder stage reads raw socket bytes here.
    pub reader: PipeReader,
}

/// Transport ends of the channel: outbound consumer, inbound producer.
#[derive(Debug)]
pub struct TransportPipes {
    /// Socket write loop drains the outbound pipe here.
    pub reader: PipeReader,

    /// Socket read loop feeds the inbound pipe here.
    pub writer: PipeWriter,
}

/// Backpressured byte channel between the pipeline and the transport.
///
/// Two unidirectional pipes with a shared watermark policy. Either side
/// completing its half completes the opposite direction too, so a dead
/// socket unwinds the whole pipeline and vice versa.
#[derive(Debug)]
pub struct DuplexByteChannel;

impl DuplexByteChannel {
    #[must_use]
    pub fn new(max_frame_size: usize) -> (AppPipes, TransportPipes) {
        let pause_threshold = scale_pause_threshold(max_frame_size);
        let outbound = PipeShared::new(pause_threshold);
        let inbound = PipeShared::new(pause_threshold);

        if let Ok(mut sibling) = outbound.sibling.lock() {
            *sibling = Arc::downgrade(&inbound);
        }
        if let Ok(mut sibling) = inbound.sibling.lock() {
            *sibling = Arc::downgrade(&outbound);
        }

        let app = AppPipes {
            writer: PipeWriter {
                shared: Arc::clone(&outbound),
            },
            reader: PipeReader { shared: inbound.clone() },
        };
        let transport = TransportPipes {
            reader: PipeReader { shared: outbound },
            writer: PipeWriter { shared: inbound },
        };
        (app, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scale_policy() {
        assert_eq!(scale_pause_threshold(16 * 1024), 512 * 1024);
        assert_eq!(scale_pause_threshold(128 * 1024), 512 * 1024);
        assert_eq!(scale_pause_threshold(256 * 1024), 2 * 1024 * 1024);
        assert_eq!(scale_pause_threshold(4 * 1024 * 1024), 8 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (app, transport) = DuplexByteChannel::new(1024);
        app.writer.write(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(transport.reader.read().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_close_propagates_to_other_half() {
        let (app, transport) = DuplexByteChannel::new(1024);
        transport.writer.close();
        // Both directions complete.
        assert!(transport.reader.read().await.is_none());
        assert!(app.reader.read().await.is_none());
        assert!(app.writer.write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_drains_before_completion() {
        let (app, transport) = DuplexByteChannel::new(1024);
        app.writer.write(Bytes::from_static(b"tail")).await.unwrap();
        drop(app);
        assert_eq!(transport.reader.read().await.unwrap(), "tail");
        assert!(transport.reader.read().await.is_none());
    }

    #[tokio::test]
    async fn test_watermark_pauses_and_resumes() {
        // Tiny threshold via the biggest scale branch.
        let (app, transport) = DuplexByteChannel::new(2 * 1024 * 1024);
        let threshold = scale_pause_threshold(2 * 1024 * 1024);

        let chunk = Bytes::from(vec![0u8; threshold / 2 + 1]);
        app.writer.write(chunk.clone()).await.unwrap();
        assert!(!app.writer.is_paused());
        app.writer.write(chunk.clone()).await.unwrap();
        assert!(app.writer.is_paused());

        // A further write must block until the reader drains below half
        // of the threshold.
        let writer = app.writer;
        let blocked = tokio::spawn(async move {
            writer.write(Bytes::from_static(b"late")).await.unwrap();
            writer
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert!(transport.reader.read().await.is_some());
        assert!(transport.reader.read().await.is_some());
        let writer = blocked.await.unwrap();
        assert!(!writer.is_paused());
        assert_eq!(transport.reader.read().await.unwrap(), "late");
    }
}
