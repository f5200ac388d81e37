// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies as plain values.
//!
//! Every bounded polling loop in this workspace (installer postflight,
//! readiness checks) takes one of these rather than baking intervals into
//! call sites.

use std::time::Duration;

/// A fixed-interval retry policy: poll every `interval`, give up after
/// `max_wait` of total elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_wait: Duration) -> Self {
        RetryPolicy { interval, max_wait }
    }

    /// Policy for conditions expected to hold almost immediately.
    pub const fn quick() -> Self {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Policy for services that take a while to start answering after their
    /// process is up.
    pub const fn service_start() -> Self {
        RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(60 * 5))
    }

    /// Policy for back-fill style services (telemetry, history) which may
    /// legitimately lag the rest of the cluster.
    pub const fn backfill() -> Self {
        RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60 * 15))
    }
}
