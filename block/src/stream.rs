// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Image streaming.
//!
//! Copies into the top image every run that is allocated somewhere between
//! the top and the base of its backing chain, then points the top image at
//! the base and drops the images in between. Without a base the whole chain
//! is flattened into the top image.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, warn};
use rate_limiter::{RateLimit, SLICE_TIME_NS};

use crate::aio::AioCompletion;
use crate::driver::BackingFile;
use crate::job::{BlockJobCommon, BlockJobDriver, JobStatus};
use crate::layer::{BlockLayer, HandleId};
use crate::{Error, Result, SECTOR_SIZE};

/// Largest run copied by one request.
pub const STREAM_BUFFER_SIZE: u64 = 512 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    Loop,
    Copying { n: u64 },
    Done,
}

struct StreamJob {
    top: HandleId,
    base: Option<HandleId>,
    base_backing: Option<BackingFile>,
    limit: RateLimit,
    phase: Phase,
    sector_num: u64,
    end: u64,
    cor_enabled: bool,
    buf: Option<Vec<u8>>,
    copied: Rc<RefCell<Option<AioCompletion>>>,
}

impl StreamJob {
    fn advance(&mut self, common: &mut BlockJobCommon, n: u64) {
        self.sector_num += n;
        common.offset += n * SECTOR_SIZE;
    }

    // Allocation status of the run starting at `sector_num`, narrowed to
    // what every layer above the base agrees on.
    fn next_run(&self, layer: &mut BlockLayer) -> Result<(bool, u64)> {
        let max = (STREAM_BUFFER_SIZE / SECTOR_SIZE).min(self.end - self.sector_num);
        let (allocated, n) = layer.is_allocated(self.top, self.sector_num, max)?;
        if allocated {
            // Already in the top image.
            return Ok((false, n));
        }
        // Past the end of a shorter top image there is nothing to copy.
        if n == 0 {
            return Ok((false, max));
        }
        let backing_hd = layer.backing_hd(self.top);
        layer.is_allocated_above(backing_hd, self.base, self.sector_num, n)
    }

    fn step(&mut self, layer: &mut BlockLayer, common: &mut BlockJobCommon) -> JobStatus {
        if common.is_cancelled() || self.sector_num >= self.end {
            return self.finish(layer, common, 0);
        }

        let (copy, n) = match self.next_run(layer) {
            Ok(run) => run,
            Err(e) => return self.finish(layer, common, e.errno()),
        };
        if !copy {
            self.advance(common, n);
            return JobStatus::Sleep(0);
        }

        if common.speed() != 0 {
            let delay = self.limit.calculate_delay(layer.clock().now_ns(), n);
            if delay > 0 {
                debug!("Stream of {} throttled for {delay}ns", layer.filename(self.top));
                return JobStatus::Sleep(delay);
            }
        }

        let mut buf = self.buf.take().unwrap_or_default();
        buf.resize((n * SECTOR_SIZE) as usize, 0);
        let copied = self.copied.clone();
        match layer.aio_copy_on_read(self.top, self.sector_num, buf, move |c| {
            *copied.borrow_mut() = Some(c);
        }) {
            Ok(req) => {
                self.phase = Phase::Copying { n };
                JobStatus::WaitIo(req)
            }
            Err(e) => self.finish(layer, common, e.errno()),
        }
    }

    fn finish(&mut self, layer: &mut BlockLayer, common: &BlockJobCommon, ret: i32) -> JobStatus {
        self.phase = Phase::Done;
        if self.cor_enabled {
            layer.disable_copy_on_read(self.top);
            self.cor_enabled = false;
        }
        if common.is_cancelled() {
            return JobStatus::Finished(-libc::ECANCELED);
        }

        let mut ret = ret;
        if ret == 0 && self.sector_num >= self.end {
            match layer.change_backing_file(self.top, self.base_backing.as_ref()) {
                Ok(()) => layer.release_intermediates(self.top, self.base),
                Err(e) => {
                    warn!(
                        "Failed to relink {} after streaming: {e}",
                        layer.filename(self.top)
                    );
                    ret = e.errno();
                }
            }
        }
        JobStatus::Finished(ret)
    }
}

impl BlockJobDriver for StreamJob {
    fn job_type(&self) -> &'static str {
        "stream"
    }

    fn set_speed(&mut self, speed: u64) -> Result<()> {
        self.limit.set_speed(speed / SECTOR_SIZE, SLICE_TIME_NS);
        Ok(())
    }

    fn run(&mut self, layer: &mut BlockLayer, common: &mut BlockJobCommon) -> JobStatus {
        match self.phase {
            Phase::Start => {
                let len = match layer.getlength(self.top) {
                    Ok(len) => len,
                    Err(e) => return self.finish(layer, common, e.errno()),
                };
                common.len = len;
                self.end = len / SECTOR_SIZE;
                if self.base.is_none() {
                    layer.enable_copy_on_read(self.top);
                    self.cor_enabled = true;
                }
                self.phase = Phase::Loop;
                JobStatus::Sleep(0)
            }
            Phase::Loop => self.step(layer, common),
            Phase::Copying { n } => {
                self.phase = Phase::Loop;
                let completion = self.copied.borrow_mut().take();
                let Some(completion) = completion else {
                    return self.finish(layer, common, -libc::ECANCELED);
                };
                if completion.ret < 0 {
                    return self.finish(layer, common, completion.ret);
                }
                self.buf = Some(completion.buf);
                self.advance(common, n);
                JobStatus::Sleep(0)
            }
            Phase::Done => JobStatus::Finished(0),
        }
    }
}

/// Starts streaming the backing chain of `top` into it, down to `base`.
/// `speed` is in bytes per second, zero for unlimited. `cb` receives 0, a
/// negative I/O error, or `-ECANCELED`.
pub fn stream_start<F>(
    layer: &mut BlockLayer,
    top: HandleId,
    base: Option<HandleId>,
    speed: u64,
    cb: F,
) -> Result<()>
where
    F: FnOnce(i32) + 'static,
{
    if let Some(base) = base {
        let mut cur = layer.backing_hd(top);
        while cur.is_some_and(|id| id != base) {
            cur = cur.and_then(|id| layer.backing_hd(id));
        }
        if cur.is_none() {
            return Err(Error::InvalidArgument(format!(
                "{} is not in the backing chain of {}",
                layer.filename(base),
                layer.filename(top)
            )));
        }
    }
    if layer.is_read_only(top) {
        return Err(Error::ReadOnly);
    }

    let base_backing = base.map(|base| BackingFile {
        filename: layer.filename(base).to_owned(),
        format: Some(layer.format_name(base).to_owned()),
    });
    let job = StreamJob {
        top,
        base,
        base_backing,
        limit: RateLimit::default(),
        phase: Phase::Start,
        sector_num: 0,
        end: 0,
        cor_enabled: false,
        buf: None,
        copied: Rc::new(RefCell::new(None)),
    };
    layer.job_create(top, Box::new(job), speed, cb)?;

    info!(
        "Streaming {} down to {}",
        layer.filename(top),
        base.map_or("the end of the chain", |b| layer.filename(b))
    );
    Ok(())
}
