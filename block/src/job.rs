// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Background block jobs.
//!
//! A job is a state machine stepped by the event loop. Each step runs until
//! the job's next suspension point, either a timer or one of its own AIO
//! requests, and reports it as a `JobStatus`. A job is `busy` while it runs
//! or waits for its I/O, and idle while it sleeps, which is when
//! cancellation can wake it early.

use std::cell::Cell;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::aio::AioRequestId;
use crate::layer::{BlockLayer, HandleId};
use crate::{Error, Result};

/// Where a job step stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// Resume after this many nanoseconds.
    Sleep(u64),
    /// Resume once the request completed.
    WaitIo(AioRequestId),
    /// The job is over, with 0 or a negative errno.
    Finished(i32),
}

/// State shared by every job type.
#[derive(Debug)]
pub struct BlockJobCommon {
    handle: HandleId,
    cancelled: bool,
    busy: bool,
    speed: u64,
    /// Progress, in bytes.
    pub offset: u64,
    /// Total amount of work, in bytes.
    pub len: u64,
}

impl BlockJobCommon {
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }
}

pub trait BlockJobDriver {
    fn job_type(&self) -> &'static str;

    /// Changes the rate limit, in bytes per second. Zero means unlimited.
    fn set_speed(&mut self, _speed: u64) -> Result<()> {
        Err(Error::NotSupported("set_speed"))
    }

    /// Runs the job until its next suspension point.
    fn run(&mut self, layer: &mut BlockLayer, common: &mut BlockJobCommon) -> JobStatus;
}

pub type BlockJobCompletion = Box<dyn FnOnce(i32)>;

#[derive(Clone, Copy, Debug)]
enum Wake {
    Now,
    At(u64),
    Io(AioRequestId),
}

pub(crate) struct BlockJob {
    common: BlockJobCommon,
    driver: Box<dyn BlockJobDriver>,
    wake: Wake,
    cb: Option<BlockJobCompletion>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockJobInfo {
    pub job_type: String,
    pub device: String,
    pub len: u64,
    pub offset: u64,
    pub speed: u64,
    pub busy: bool,
}

impl BlockLayer {
    fn job(&self, id: HandleId) -> Result<&BlockJob> {
        self.bs(id)
            .job
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("no block job on {}", self.filename(id))))
    }

    fn job_mut(&mut self, id: HandleId) -> Result<&mut BlockJob> {
        let bs = self.bs_mut(id);
        match bs.job.as_mut() {
            Some(job) => Ok(job),
            None => Err(Error::NotFound(format!(
                "no block job on {}",
                bs.device_name
            ))),
        }
    }

    /// Attaches a job to the handle and schedules its first step.
    pub fn job_create<F>(
        &mut self,
        id: HandleId,
        driver: Box<dyn BlockJobDriver>,
        speed: u64,
        cb: F,
    ) -> Result<()>
    where
        F: FnOnce(i32) + 'static,
    {
        if self.bs(id).job.is_some() {
            return Err(Error::Busy);
        }

        let mut job = BlockJob {
            common: BlockJobCommon {
                handle: id,
                cancelled: false,
                busy: true,
                speed: 0,
                offset: 0,
                len: 0,
            },
            driver,
            wake: Wake::Now,
            cb: Some(Box::new(cb)),
        };
        if speed != 0 {
            job.driver.set_speed(speed)?;
            job.common.speed = speed;
        }

        debug!(
            "Created {} job on {}",
            job.driver.job_type(),
            self.filename(id)
        );
        self.bs_mut(id).job = Some(job);
        Ok(())
    }

    pub fn job_set_speed(&mut self, id: HandleId, speed: u64) -> Result<()> {
        let job = self.job_mut(id)?;
        job.driver.set_speed(speed)?;
        job.common.speed = speed;
        Ok(())
    }

    /// Asks the job to stop at its next suspension point. A sleeping job is
    /// woken up right away.
    pub fn job_cancel(&mut self, id: HandleId) -> Result<()> {
        let job = self.job_mut(id)?;
        job.common.cancelled = true;
        if !job.common.busy {
            job.wake = Wake::Now;
        }
        Ok(())
    }

    pub fn job_is_cancelled(&self, id: HandleId) -> bool {
        self.job(id).is_ok_and(|job| job.common.cancelled)
    }

    /// Cancels the job and runs the event loop until it completed.
    /// Returns the job's final status.
    pub fn job_cancel_sync(&mut self, id: HandleId) -> Result<i32> {
        self.job_cancel(id)?;

        let status = Rc::new(Cell::new(None));
        let job = self.job_mut(id)?;
        let cb = job.cb.take();
        let result = status.clone();
        job.cb = Some(Box::new(move |ret| {
            result.set(Some(ret));
            if let Some(cb) = cb {
                cb(ret);
            }
        }));

        while status.get().is_none() {
            if !self.poll() && !self.wait_until(self.next_deadline()) {
                warn!("Block job on {} cannot make progress", self.filename(id));
                break;
            }
        }
        Ok(status.get().unwrap_or(-libc::ECANCELED))
    }

    pub fn job_info(&self, id: HandleId) -> Option<BlockJobInfo> {
        let bs = self.try_bs(id)?;
        let job = bs.job.as_ref()?;
        Some(BlockJobInfo {
            job_type: job.driver.job_type().to_owned(),
            device: bs.device_name.clone(),
            len: job.common.len,
            offset: job.common.offset,
            speed: job.common.speed,
            busy: job.common.busy,
        })
    }

    pub fn jobs(&self) -> Vec<BlockJobInfo> {
        self.handles().filter_map(|id| self.job_info(id)).collect()
    }

    pub(crate) fn next_job_deadline(&self) -> Option<u64> {
        self.handles()
            .filter_map(|id| self.bs(id).job.as_ref())
            .filter_map(|job| match job.wake {
                Wake::Now => Some(self.clock().now_ns()),
                Wake::At(t) => Some(t),
                Wake::Io(_) => None,
            })
            .min()
    }

    fn job_ready(&self, job: &BlockJob, now: u64, timers: bool) -> bool {
        match job.wake {
            Wake::Now => true,
            Wake::At(t) => timers && t <= now,
            Wake::Io(req) => !self.aio.contains(req),
        }
    }

    fn step_job(&mut self, id: HandleId) {
        let Some(mut job) = self.try_bs_mut(id).and_then(|bs| bs.job.take()) else {
            return;
        };

        job.common.busy = true;
        let status = job.driver.run(self, &mut job.common);
        match status {
            // A cancelled job does not sleep.
            JobStatus::Sleep(_) if job.common.cancelled => job.wake = Wake::Now,
            JobStatus::Sleep(ns) => {
                job.common.busy = false;
                job.wake = Wake::At(self.clock().now_ns() + ns);
            }
            JobStatus::WaitIo(req) => job.wake = Wake::Io(req),
            JobStatus::Finished(ret) => {
                job.common.busy = false;
                info!(
                    "{} job on {} finished: {ret}",
                    job.driver.job_type(),
                    self.filename(id)
                );
                if let Some(cb) = job.cb.take() {
                    cb(ret);
                }
                return;
            }
        }

        if let Some(bs) = self.try_bs_mut(id) {
            bs.job = Some(job);
        }
    }

    // Steps every job whose suspension point was reached.
    pub(crate) fn run_jobs(&mut self, timers: bool) -> bool {
        let now = self.clock().now_ns();
        let ready: Vec<HandleId> = self
            .handles()
            .filter(|id| {
                self.bs(*id)
                    .job
                    .as_ref()
                    .is_some_and(|job| self.job_ready(job, now, timers))
            })
            .collect();

        for id in ready.iter() {
            self.step_job(*id);
        }
        !ready.is_empty()
    }
}
