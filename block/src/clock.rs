// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::cell::Cell;
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source driving AIO dispatch and job timers.
pub trait Clock {
    fn now_ns(&self) -> u64;
    fn sleep_ns(&self, ns: u64);
}

/// Host monotonic clock, counted from its creation.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        HostClock {
            start: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn sleep_ns(&self, ns: u64) {
        thread::sleep(Duration::from_nanos(ns));
    }
}

/// Clock that only moves when told to. Sleeping advances it instantly.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: Cell<u64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ns: u64) {
        self.now.set(self.now.get() + ns);
    }
}

impl Clock for VirtualClock {
    fn now_ns(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ns(&self, ns: u64) {
        self.advance(ns);
    }
}
