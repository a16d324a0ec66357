// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use crate::{Error, OpenFlags, Result};

/// Backing file reference recorded in an image header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackingFile {
    pub filename: String,
    /// Format of the backing file, when the image format records it.
    pub format: Option<String>,
}

/// An image format or transport protocol.
///
/// A driver is registered once and opened any number of times, each open
/// returning the per handle state the block layer dispatches I/O to.
pub trait BlockDriver {
    fn format_name(&self) -> &'static str;

    /// Scheme handled by this driver, as in `nbd:host:port`.
    fn protocol_name(&self) -> Option<&'static str> {
        None
    }

    /// Scores how likely `buf`, the first bytes of `filename`, is an image
    /// of this format. Zero means never.
    fn probe(&self, _buf: &[u8], _filename: &str) -> u32 {
        0
    }

    fn can_create(&self) -> bool {
        false
    }

    fn create(&self, _filename: &str, _size: u64, _backing: Option<&BackingFile>) -> Result<()> {
        Err(Error::NotSupported("create"))
    }

    fn open(&self, filename: &str, flags: OpenFlags) -> Result<Box<dyn DriverState>>;
}

/// State of one opened image, addressed in 512 bytes sectors.
pub trait DriverState {
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Image size in bytes.
    fn length(&mut self) -> Result<u64>;

    fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(Error::NotSupported("truncate"))
    }

    /// Tells whether `sector` is allocated in this image, along with the
    /// number of following sectors, at most `nb_sectors`, sharing that
    /// state. Images without a backing file are fully allocated.
    fn is_allocated(&mut self, _sector: u64, nb_sectors: u64) -> Result<(bool, u64)> {
        Ok((true, nb_sectors))
    }

    fn backing_file(&self) -> Option<BackingFile> {
        None
    }

    fn change_backing_file(&mut self, _backing: Option<&BackingFile>) -> Result<()> {
        Err(Error::NotSupported("change_backing_file"))
    }

    /// Whether a freshly created image reads as zeroes.
    fn has_zero_init(&self) -> bool {
        true
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    fn is_inserted(&self) -> bool {
        true
    }

    fn eject(&mut self, _open: bool) -> Result<()> {
        Ok(())
    }

    fn set_locked(&mut self, _locked: bool) {}

    /// Delay the AIO pool applies before dispatching a request.
    fn aio_latency_ns(&self) -> u64 {
        0
    }

    fn close(&mut self) {}
}
