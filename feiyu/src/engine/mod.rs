// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

mod ack_waiter;
mod heartbeat;
mod qos1;
mod qos2;

pub use ack_waiter::AckWaiter;
pub use heartbeat::Heartbeat;
pub use qos1::Qos1Engine;
pub use qos2::Qos2Engine;

/// Deadline check cadence for an engine working with `interval` deadlines.
///
/// One second is the reference tick; engines configured with a shorter
/// deadline (tests drive it down to zero) tick faster so expiry
/// granularity tracks the deadline.
fn tick_period(interval: Duration) -> Duration {
    interval.clamp(Duration::from_millis(50), Duration::from_secs(1))
}
