// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Asynchronous requests and the event loop running them.
//!
//! Requests are queued at submission and executed when the loop dispatches
//! them, once the latency reported by the driver has elapsed. Completion
//! callbacks run from the loop, never from the submitting call, and
//! requests on one handle may complete out of submission order.

use std::collections::BTreeMap;

use log::{debug, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::layer::{BlockLayer, HandleId};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AioRequestId(u64);

/// Outcome of an asynchronous request: 0 or a negative errno, and the
/// buffer the request was submitted with.
#[derive(Debug)]
pub struct AioCompletion {
    pub ret: i32,
    pub buf: Vec<u8>,
}

pub type AioCallback = Box<dyn FnOnce(AioCompletion)>;

#[derive(Clone, Copy, Debug)]
pub(crate) enum AioOp {
    Read { sector: u64 },
    Write { sector: u64 },
    Flush,
    CopyOnRead { sector: u64 },
}

struct AsyncRequest {
    handle: HandleId,
    op: AioOp,
    buf: Vec<u8>,
    cb: AioCallback,
    dispatch_at: u64,
}

pub(crate) struct AioPool {
    requests: BTreeMap<AioRequestId, AsyncRequest>,
    next_id: u64,
    notifier: EventFd,
}

impl AioPool {
    pub(crate) fn new() -> Result<Self> {
        Ok(AioPool {
            requests: BTreeMap::new(),
            next_id: 0,
            notifier: EventFd::new(libc::EFD_NONBLOCK).map_err(Error::Io)?,
        })
    }

    pub(crate) fn contains(&self, req: AioRequestId) -> bool {
        self.requests.contains_key(&req)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.requests.values().map(|r| r.dispatch_at).min()
    }
}

impl BlockLayer {
    fn aio_submit(
        &mut self,
        id: HandleId,
        op: AioOp,
        buf: Vec<u8>,
        cb: AioCallback,
    ) -> Result<AioRequestId> {
        match op {
            AioOp::Read { sector } => self.check_read(id, sector, buf.len())?,
            AioOp::Write { sector } | AioOp::CopyOnRead { sector } => {
                self.check_write(id, sector, buf.len())?
            }
            AioOp::Flush => {}
        }

        let bs = self.bs_mut(id);
        bs.in_flight += 1;
        let latency = bs.opaque.aio_latency_ns();
        let dispatch_at = self.clock().now_ns() + latency;

        let req = AioRequestId(self.aio.next_id);
        self.aio.next_id += 1;
        self.aio.requests.insert(
            req,
            AsyncRequest {
                handle: id,
                op,
                buf,
                cb,
                dispatch_at,
            },
        );
        if let Err(e) = self.aio.notifier.write(1) {
            warn!("Failed to signal AIO notifier: {e}");
        }

        debug!("Submitted {op:?} as {req:?}, due at {dispatch_at}");
        Ok(req)
    }

    /// Reads `buf.len()` bytes from `sector`. The buffer is handed back
    /// filled to `cb`.
    pub fn aio_read<F>(
        &mut self,
        id: HandleId,
        sector: u64,
        buf: Vec<u8>,
        cb: F,
    ) -> Result<AioRequestId>
    where
        F: FnOnce(AioCompletion) + 'static,
    {
        self.aio_submit(id, AioOp::Read { sector }, buf, Box::new(cb))
    }

    pub fn aio_write<F>(
        &mut self,
        id: HandleId,
        sector: u64,
        buf: Vec<u8>,
        cb: F,
    ) -> Result<AioRequestId>
    where
        F: FnOnce(AioCompletion) + 'static,
    {
        self.aio_submit(id, AioOp::Write { sector }, buf, Box::new(cb))
    }

    pub fn aio_flush<F>(&mut self, id: HandleId, cb: F) -> Result<AioRequestId>
    where
        F: FnOnce(AioCompletion) + 'static,
    {
        self.aio_submit(id, AioOp::Flush, Vec::new(), Box::new(cb))
    }

    // Read through the backing chain that always populates the image.
    pub(crate) fn aio_copy_on_read<F>(
        &mut self,
        id: HandleId,
        sector: u64,
        buf: Vec<u8>,
        cb: F,
    ) -> Result<AioRequestId>
    where
        F: FnOnce(AioCompletion) + 'static,
    {
        self.aio_submit(id, AioOp::CopyOnRead { sector }, buf, Box::new(cb))
    }

    /// Drops a pending request without running it. Its callback is never
    /// called.
    ///
    /// Panics if `req` already completed or was never submitted.
    pub fn aio_cancel(&mut self, req: AioRequestId) {
        let Some(request) = self.aio.requests.remove(&req) else {
            panic!("cancelling untracked AIO request {req:?}");
        };
        self.bs_mut(request.handle).in_flight -= 1;
        debug!("Cancelled {req:?}");
    }

    pub fn aio_pending(&self, req: AioRequestId) -> bool {
        self.aio.contains(req)
    }

    /// Number of requests submitted on the handle and not completed yet.
    pub fn in_flight(&self, id: HandleId) -> u32 {
        self.bs(id).in_flight
    }

    /// Signalled on each submission, for an outer loop to poll on.
    pub fn notifier(&self) -> &EventFd {
        &self.aio.notifier
    }

    fn execute(&mut self, id: HandleId, op: AioOp, buf: &mut [u8]) -> i32 {
        let res = match op {
            AioOp::Read { sector } => {
                let copy_on_read = self.is_copy_on_read(id);
                self.read_accounted(id, sector, buf, copy_on_read)
            }
            AioOp::CopyOnRead { sector } => self.read_accounted(id, sector, buf, true),
            AioOp::Write { sector } => self.write_accounted(id, sector, buf),
            AioOp::Flush => self.flush_accounted(id),
        };
        match res {
            Ok(()) => 0,
            Err(e) => {
                debug!("{op:?} failed: {e}");
                e.errno()
            }
        }
    }

    fn dispatch_requests(&mut self, now: u64) -> bool {
        let mut ready: Vec<(u64, AioRequestId)> = self
            .aio
            .requests
            .iter()
            .filter(|(_, r)| r.dispatch_at <= now)
            .map(|(req, r)| (r.dispatch_at, *req))
            .collect();
        ready.sort_unstable();

        for (_, req) in ready.iter() {
            let Some(mut request) = self.aio.requests.remove(req) else {
                continue;
            };
            let ret = self.execute(request.handle, request.op, &mut request.buf);
            self.bs_mut(request.handle).in_flight -= 1;
            (request.cb)(AioCompletion {
                ret,
                buf: request.buf,
            });
        }
        !ready.is_empty()
    }

    // One pass over ready requests then runnable jobs. Jobs sleeping on a
    // timer only run when `timers` is set.
    fn poll_round(&mut self, timers: bool) -> bool {
        // Only clears the counter, an error means it was already zero.
        let _ = self.aio.notifier.read();
        let now = self.clock().now_ns();
        let mut progress = self.dispatch_requests(now);
        progress |= self.run_jobs(timers);
        progress
    }

    // Sleeps until `deadline`. Returns false when there is nothing to wait
    // for.
    pub(crate) fn wait_until(&self, deadline: Option<u64>) -> bool {
        let Some(deadline) = deadline else {
            return false;
        };
        let now = self.clock().now_ns();
        if deadline > now {
            self.clock().sleep_ns(deadline - now);
        }
        true
    }

    pub(crate) fn next_deadline(&self) -> Option<u64> {
        [self.aio.next_deadline(), self.next_job_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Runs whatever is ready now. Returns whether anything ran.
    pub fn poll(&mut self) -> bool {
        self.poll_round(true)
    }

    /// Runs requests and jobs, sleeping between deadlines, until nothing is
    /// left.
    pub fn run_until_idle(&mut self) {
        loop {
            if self.poll_round(true) {
                continue;
            }
            if !self.wait_until(self.next_deadline()) {
                break;
            }
        }
    }

    /// Completes every pending request. Jobs waiting on their own I/O keep
    /// running, jobs sleeping on a timer stay asleep.
    pub fn drain_all(&mut self) {
        while !self.aio.is_empty() {
            if !self.poll_round(false) {
                self.wait_until(self.aio.next_deadline());
            }
        }
    }
}
