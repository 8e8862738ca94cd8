// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::byte_channel::{ChannelCloser, TransportPipes};
use crate::status::{ConnectionStatus, StatusCell};
use crate::transport::Stream;
use crate::types::DisconnectEvent;

/// Bytes asked from the socket per read call.
const READ_CHUNK: usize = 16 * 1024;

/// Shuttles bytes between an established socket and the duplex byte
/// channel.
///
/// One read loop and one write loop run until the socket dies, the
/// channel completes, or an abort is requested. Whichever terminal signal
/// fires first claims the termination reason; cleanup then completes both
/// pipe directions so every other stage unwinds.
pub struct TransportDriver {
    status: Arc<StatusCell>,
    terminated_tx: Arc<watch::Sender<Option<DisconnectEvent>>>,
    terminated_rx: watch::Receiver<Option<DisconnectEvent>>,
    abort_tx: watch::Sender<bool>,
    writes_done_rx: watch::Receiver<bool>,
    closer: ChannelCloser,
}

/// Record `event` as the termination reason unless one is set already.
fn set_reason(tx: &watch::Sender<Option<DisconnectEvent>>, event: DisconnectEvent) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(event);
            true
        } else {
            false
        }
    });
}

/// Wait until the abort flag flips to true.
async fn wait_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl TransportDriver {
    /// Spawn the read/write loops over an established stream.
    #[must_use]
    pub fn start(stream: Stream, pipes: TransportPipes, status: Arc<StatusCell>) -> Self {
        match stream {
            Stream::Tcp(socket) => Self::spawn(socket, pipes, status),
            Stream::Tls(socket) => Self::spawn(*socket, pipes, status),
            Stream::Memory(socket) => Self::spawn(socket, pipes, status),
        }
    }

    fn spawn<S>(stream: S, pipes: TransportPipes, status: Arc<StatusCell>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (terminated_tx, terminated_rx) = watch::channel(None);
        let terminated_tx = Arc::new(terminated_tx);
        let (abort_tx, abort_rx) = watch::channel(false);
        let (writes_done_tx, writes_done_rx) = watch::channel(false);

        let TransportPipes {
            reader: out_reader,
            writer: in_writer,
        } = pipes;
        let closer = in_writer.closer();

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let read_task: JoinHandle<()> = {
            let terminated_tx = Arc::clone(&terminated_tx);
            let mut abort_rx = abort_rx.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(READ_CHUNK);
                loop {
                    buf.reserve(READ_CHUNK);
                    tokio::select! {
                        _ = wait_abort(&mut abort_rx) => break,
                        res = read_half.read_buf(&mut buf) => match res {
                            Ok(0) => {
                                set_reason(
                                    &terminated_tx,
                                    DisconnectEvent::TransportError(
                                        "Connection closed by peer".to_string(),
                                    ),
                                );
                                break;
                            }
                            Ok(_n) => {
                                let chunk = buf.split().freeze();
                                if in_writer.write(chunk).await.is_err() {
                                    // Channel completed under us.
                                    break;
                                }
                            }
                            Err(err) => {
                                set_reason(
                                    &terminated_tx,
                                    DisconnectEvent::TransportError(format!(
                                        "Socket read failed: {err}"
                                    )),
                                );
                                break;
                            }
                        },
                    }
                }
                in_writer.close();
            })
        };

        let write_task: JoinHandle<()> = {
            let terminated_tx = Arc::clone(&terminated_tx);
            let mut abort_rx = abort_rx;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = wait_abort(&mut abort_rx) => break,
                        maybe = out_reader.read() => match maybe {
                            Some(chunk) => {
                                // write_all retries partial sends until the
                                // whole block is on the wire.
                                if let Err(err) = write_half.write_all(&chunk).await {
                                    set_reason(
                                        &terminated_tx,
                                        DisconnectEvent::TransportError(format!(
                                            "Socket write failed: {err}"
                                        )),
                                    );
                                    break;
                                }
                            }
                            // Outbound pipe completed and fully drained.
                            None => break,
                        },
                    }
                }
                let _ = write_half.shutdown().await;
                let _ = writes_done_tx.send(true);
                out_reader.close();
            })
        };

        // Cleanup: once both loops are done the reason is final and the
        // observable status follows it.
        {
            let terminated_tx = Arc::clone(&terminated_tx);
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                let _ = read_task.await;
                let _ = write_task.await;
                set_reason(&terminated_tx, DisconnectEvent::Normal);
                if status.get() == ConnectionStatus::Connected {
                    match &*terminated_tx.borrow() {
                        Some(DisconnectEvent::TransportError(_)) => {
                            status.set(ConnectionStatus::Failed);
                        }
                        _ => status.set(ConnectionStatus::Disconnected),
                    }
                }
            });
        }

        Self {
            status,
            terminated_tx,
            terminated_rx,
            abort_tx,
            writes_done_rx,
            closer,
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Get a fresh observer of the termination signal.
    #[must_use]
    pub fn when_terminated(&self) -> watch::Receiver<Option<DisconnectEvent>> {
        self.terminated_rx.clone()
    }

    /// Wait until the driver terminated and return the reason.
    pub async fn terminated(&self) -> DisconnectEvent {
        let mut rx = self.terminated_rx.clone();
        loop {
            if let Some(event) = rx.borrow().clone() {
                return event;
            }
            if rx.changed().await.is_err() {
                return DisconnectEvent::Normal;
            }
        }
    }

    /// Wait until every byte queued before the channel completed has been
    /// handed to the socket.
    pub async fn wait_for_pending_writes(&self) {
        let mut rx = self.writes_done_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Graceful shutdown: stop accepting outbound bytes, drain what is
    /// queued, then stop the loops. Falls back to an abort when draining
    /// exceeds `grace`.
    pub async fn close(&self, grace: Duration) {
        set_reason(&self.terminated_tx, DisconnectEvent::Normal);
        self.closer.close();
        if tokio::time::timeout(grace, self.wait_for_pending_writes())
            .await
            .is_err()
        {
            log::warn!("transport: drain grace expired, aborting");
            self.abort();
            return;
        }
        let _ = self.abort_tx.send(true);
        self.status.set(ConnectionStatus::Disconnected);
    }

    /// Forced shutdown, nothing is drained.
    pub fn abort(&self) {
        set_reason(
            &self.terminated_tx,
            DisconnectEvent::TransportError("Aborted by session".to_string()),
        );
        let _ = self.abort_tx.send(true);
        self.closer.close();
        self.status.set(ConnectionStatus::Aborted);
    }
}
