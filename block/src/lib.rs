// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Block layer: pluggable image drivers behind one handle based API, a
//! cooperative AIO pool and background block jobs.

pub mod aio;
pub mod blksim;
pub mod clock;
pub mod cow;
pub mod driver;
pub mod job;
pub mod layer;
pub mod nbd_client;
pub mod raw;
pub mod registry;
pub mod stats;
pub mod stream;

use std::io;

use bitflags::bitflags;
use nbd::NbdError;
use thiserror::Error;

pub use aio::{AioCompletion, AioRequestId};
pub use clock::{Clock, HostClock, VirtualClock};
pub use driver::{BackingFile, BlockDriver, DriverState};
pub use job::{BlockJobCommon, BlockJobDriver, BlockJobInfo, JobStatus};
pub use layer::{BlockLayer, Geometry, HandleId};
pub use registry::DriverRegistry;
pub use stats::{BlockAcctStats, BlockAcctType, BlockErrorAction, BlockdevOnError, IoStatus};
pub use stream::stream_start;

pub const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

bitflags! {
    /// Flags passed unchanged from the consumer to `BlockLayer::open`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open read-write. Without it the handle is read-only.
        const RDWR = 0x0002;
        /// Create the file if it does not exist.
        const CREAT = 0x0004;
        /// Redirect writes to a temporary overlay discarded on close.
        const SNAPSHOT = 0x0008;
        /// Open as a plain file, skipping format probing.
        const NO_PROBE = 0x0010;
        /// Bypass the host page cache.
        const NOCACHE = 0x0020;
        /// Do not open the backing file.
        const NO_BACKING = 0x0100;
        /// Populate the image from its backing chain on read.
        const COPY_ON_READ = 0x0400;
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown driver, format or device: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Protocol violation")]
    ProtocolViolation(#[source] NbdError),
    #[error(
        "Request for {nb_sectors} sectors at sector {sector} is beyond the end of the image ({total_sectors} sectors)"
    )]
    BoundsViolation {
        sector: u64,
        nb_sectors: u64,
        total_sectors: u64,
    },
    #[error("I/O error")]
    Io(#[source] io::Error),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device or job is busy")]
    Busy,
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("No medium inserted")]
    NoMedium,
    #[error("NBD request failed")]
    Nbd(#[source] NbdError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative errno equivalent, as handed to AIO completions and job
    /// callbacks.
    pub fn errno(&self) -> i32 {
        -match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::ProtocolViolation(_) => libc::EPROTO,
            Error::BoundsViolation { .. } => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Cancelled => libc::ECANCELED,
            Error::ReadOnly => libc::EACCES,
            Error::Busy => libc::EBUSY,
            Error::NotSupported(_) | Error::InvalidOperation(_) => libc::ENOTSUP,
            Error::NoMedium => libc::ENOMEDIUM,
            Error::Nbd(NbdError::Remote(code)) if *code != 0 => *code as i32,
            Error::Nbd(_) => libc::EIO,
        }
    }

    /// Builds an error from a negative errno.
    pub fn from_errno(ret: i32) -> Self {
        match -ret {
            libc::ECANCELED => Error::Cancelled,
            libc::EBUSY => Error::Busy,
            libc::ENOMEDIUM => Error::NoMedium,
            libc::EACCES | libc::EROFS => Error::ReadOnly,
            errno => Error::Io(io::Error::from_raw_os_error(errno)),
        }
    }
}

impl From<NbdError> for Error {
    fn from(e: NbdError) -> Self {
        if e.is_protocol_violation() {
            return Error::ProtocolViolation(e);
        }
        match e {
            NbdError::InvalidAddress(addr) => {
                Error::InvalidArgument(format!("invalid NBD address {addr}"))
            }
            NbdError::Connect(e) | NbdError::Io(e) => Error::Io(e),
            e => Error::Nbd(e),
        }
    }
}

/// Splits `filename` into its `scheme:` prefix, if any.
///
/// Single letter prefixes are drive letters, not schemes.
pub fn protocol_prefix(filename: &str) -> Option<&str> {
    let end = filename.find([':', '/', '\\'])?;
    if filename.as_bytes()[end] != b':' || end < 2 {
        return None;
    }
    Some(&filename[..end])
}

/// Resolves a backing file name relative to the image that references it.
pub fn path_combine(base_path: &str, filename: &str) -> String {
    if filename.starts_with('/') || protocol_prefix(filename).is_some() {
        return filename.to_owned();
    }
    match base_path.rfind('/') {
        Some(pos) => format!("{}{}", &base_path[..=pos], filename),
        None => filename.to_owned(),
    }
}
