// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Connection status of the transport currently backing the session.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connect attempt has been made yet.
    #[default]
    NotStarted = 0,

    /// A connect attempt is in flight.
    Connecting = 1,

    /// The transport is up and CONNACK has been accepted.
    /// Publish/subscribe packets can be sent now.
    Connected = 2,

    /// The session ended with a graceful disconnect.
    Disconnected = 3,

    /// The transport was torn down without draining.
    Aborted = 4,

    /// The connection died or could not be established.
    Failed = 5,
}

impl From<u8> for ConnectionStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            4 => Self::Aborted,
            5 => Self::Failed,
            _ => Self::NotStarted,
        }
    }
}

/// Atomic status holder observers read without locking.
///
/// Writers are the transport driver and the supervisor; every other actor
/// only calls `get`. Termination, the one transition callers wait on, has
/// its own watch channel; plain status changes are pollable state, not
/// events.
#[derive(Debug, Default)]
pub struct StatusCell {
    status: AtomicU8,
}

impl StatusCell {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(ConnectionStatus::NotStarted as u8),
        })
    }

    #[must_use]
    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ConnectionStatus::NotStarted);
        cell.set(ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connecting);
        cell.set(ConnectionStatus::Connected);
        assert_eq!(cell.get(), ConnectionStatus::Connected);
    }
}
