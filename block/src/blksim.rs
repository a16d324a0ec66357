// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Simulated disk for tests.
//!
//! Any filename prefixed with `blksim:` is claimed by this driver whatever
//! the image content, overriding the usual probing outcome. The file
//! behind the prefix is accessed as a raw image while the driver adds AIO
//! latency and returns injected errors for configured sector ranges.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, error};

use crate::driver::{BlockDriver, DriverState};
use crate::raw::RawFileDisk;
use crate::{Error, OpenFlags, Result, SECTOR_SIZE};

pub const BLKSIM_PREFIX: &str = "blksim:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimOp {
    Read,
    Write,
}

/// Error returned for requests of type `op` touching sectors
/// `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimFault {
    pub op: SimOp,
    pub start: u64,
    pub end: u64,
    /// Negative errno handed back to the caller.
    pub errno: i32,
}

#[derive(Clone, Debug, Default)]
pub struct SimConfig {
    /// Delay before each AIO request is dispatched.
    pub latency_ns: u64,
    pub faults: Vec<SimFault>,
}

#[derive(Debug, Default)]
struct SimState {
    faults: Vec<SimFault>,
    reads: u64,
    writes: u64,
}

/// Shared handle used by tests to inject faults and observe traffic on
/// every image opened through one `SimDriver`.
#[derive(Clone, Debug, Default)]
pub struct SimControl {
    state: Rc<RefCell<SimState>>,
}

impl SimControl {
    pub fn inject(&self, fault: SimFault) {
        self.state.borrow_mut().faults.push(fault);
    }

    pub fn clear(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Sectors read so far.
    pub fn reads(&self) -> u64 {
        self.state.borrow().reads
    }

    /// Sectors written so far.
    pub fn writes(&self) -> u64 {
        self.state.borrow().writes
    }

    fn check(&self, op: SimOp, sector: u64, nb_sectors: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let end = sector + nb_sectors;
        if let Some(fault) = state
            .faults
            .iter()
            .find(|f| f.op == op && f.start < end && sector < f.end)
        {
            debug!("blksim: injecting {} on {op:?} at sector {sector}", fault.errno);
            return Err(Error::from_errno(fault.errno));
        }
        match op {
            SimOp::Read => state.reads += nb_sectors,
            SimOp::Write => state.writes += nb_sectors,
        }
        Ok(())
    }
}

pub struct SimDriver {
    latency_ns: u64,
    control: SimControl,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let control = SimControl::default();
        for fault in config.faults {
            control.inject(fault);
        }
        SimDriver {
            latency_ns: config.latency_ns,
            control,
        }
    }

    pub fn control(&self) -> SimControl {
        self.control.clone()
    }
}

impl BlockDriver for SimDriver {
    fn format_name(&self) -> &'static str {
        "blksim"
    }

    fn probe(&self, _buf: &[u8], filename: &str) -> u32 {
        if filename.starts_with(BLKSIM_PREFIX) {
            200
        } else {
            0
        }
    }

    fn open(&self, filename: &str, flags: OpenFlags) -> Result<Box<dyn DriverState>> {
        let path = filename.strip_prefix(BLKSIM_PREFIX).unwrap_or(filename);
        Ok(Box::new(SimDisk {
            path: path.to_owned(),
            file: RawFileDisk::open(path, flags)?,
            latency_ns: self.latency_ns,
            control: self.control.clone(),
        }))
    }
}

pub struct SimDisk {
    path: String,
    file: RawFileDisk,
    latency_ns: u64,
    control: SimControl,
}

impl SimDisk {
    // Host I/O failures have no recovery path in a simulated disk. Stop
    // right there so the failing state can be inspected.
    fn fatal(&self, op: SimOp, sector: u64, e: Error) -> ! {
        error!(
            "blksim: {op:?} at sector {sector} of {} failed: {e}",
            self.path
        );
        panic!("blksim: unrecoverable host I/O error on {}", self.path);
    }
}

impl DriverState for SimDisk {
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.control
            .check(SimOp::Read, sector, buf.len() as u64 / SECTOR_SIZE)?;
        if let Err(e) = self.file.read(sector, buf) {
            self.fatal(SimOp::Read, sector, e);
        }
        Ok(())
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        self.control
            .check(SimOp::Write, sector, buf.len() as u64 / SECTOR_SIZE)?;
        if let Err(e) = self.file.write(sector, buf) {
            self.fatal(SimOp::Write, sector, e);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    fn length(&mut self) -> Result<u64> {
        self.file.length()
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.truncate(size)
    }

    fn has_zero_init(&self) -> bool {
        self.file.has_zero_init()
    }

    fn aio_latency_ns(&self) -> u64 {
        self.latency_ns
    }
}
