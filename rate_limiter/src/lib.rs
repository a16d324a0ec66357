// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

#![deny(missing_docs)]
//! # Rate Limiter
//!
//! Provides a slice based rate limiter used to throttle background block
//! jobs.
//!
//! Time is divided into fixed size slices. Each slice admits up to
//! `slice_quota` units (sectors, bytes, ops, the unit is chosen by the
//! caller). The first dispatch of a slice is always admitted regardless of
//! its size, so a caller can never be starved by a request that is larger
//! than the quota: it bursts once and then waits for the following slice.
//!
//! The limiter does not own a clock. Callers pass the current monotonic
//! time in nanoseconds, which keeps it usable from a single threaded event
//! loop with virtual time.

/// Default slice length, 100ms.
pub const SLICE_TIME_NS: u64 = 100_000_000;

const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// Token bucket over fixed size time slices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimit {
    next_slice_time: u64,
    slice_quota: u64,
    slice_time: u64,
    dispatched: u64,
}

impl RateLimit {
    /// Creates a limiter admitting `speed` units per second over slices of
    /// `slice_ns` nanoseconds.
    pub fn new(speed: u64, slice_ns: u64) -> Self {
        let mut limit = RateLimit::default();
        limit.set_speed(speed, slice_ns);
        limit
    }

    /// Changes the admitted rate.
    ///
    /// The current slice and the amount already dispatched within it are
    /// kept, so a speed change takes full effect from the next slice.
    pub fn set_speed(&mut self, speed: u64, slice_ns: u64) {
        self.slice_time = slice_ns;
        self.slice_quota =
            ((u128::from(speed) * u128::from(slice_ns)) / u128::from(NANOSECONDS_PER_SECOND))
                .min(u128::from(u64::MAX)) as u64;
    }

    /// Accounts for `n` units dispatched at `now_ns`.
    ///
    /// Returns 0 if the units are admitted, or the number of nanoseconds the
    /// caller must wait before retrying. A refused dispatch is charged as the
    /// opening debit of the following slice.
    pub fn calculate_delay(&mut self, now_ns: u64, n: u64) -> u64 {
        if self.next_slice_time <= now_ns {
            self.next_slice_time = now_ns.saturating_add(self.slice_time);
            self.dispatched = 0;
        }

        if self.dispatched == 0 || self.dispatched.saturating_add(n) <= self.slice_quota {
            self.dispatched = self.dispatched.saturating_add(n);
            0
        } else {
            self.dispatched = n;
            self.next_slice_time - now_ns
        }
    }

    /// Units admitted per slice.
    pub fn slice_quota(&self) -> u64 {
        self.slice_quota
    }

    /// Length of a slice in nanoseconds.
    pub fn slice_time(&self) -> u64 {
        self.slice_time
    }

    /// Units charged against the current slice.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Monotonic time at which the current slice ends.
    pub fn next_slice_time(&self) -> u64 {
        self.next_slice_time
    }
}
