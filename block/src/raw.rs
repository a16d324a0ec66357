// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;

use log::{debug, warn};

use crate::driver::{BackingFile, BlockDriver, DriverState};
use crate::{Error, OpenFlags, Result, SECTOR_SIZE};

const DIRECT_IO_ALIGNMENT: usize = 4096;

fn round_down(offset: u64) -> u64 {
    offset / DIRECT_IO_ALIGNMENT as u64 * DIRECT_IO_ALIGNMENT as u64
}

fn round_up(len: usize) -> usize {
    len.div_ceil(DIRECT_IO_ALIGNMENT) * DIRECT_IO_ALIGNMENT
}

/// Plain image file, also serving the `file:` protocol.
pub struct RawDriver;

impl BlockDriver for RawDriver {
    fn format_name(&self) -> &'static str {
        "raw"
    }

    fn protocol_name(&self) -> Option<&'static str> {
        Some("file")
    }

    fn probe(&self, _buf: &[u8], _filename: &str) -> u32 {
        1
    }

    fn can_create(&self) -> bool {
        true
    }

    fn create(&self, filename: &str, size: u64, backing: Option<&BackingFile>) -> Result<()> {
        if backing.is_some() {
            return Err(Error::InvalidArgument(
                "raw images have no backing file".to_owned(),
            ));
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(strip_file_prefix(filename))
            .map_err(Error::Io)?;
        file.set_len(size).map_err(Error::Io)
    }

    fn open(&self, filename: &str, flags: OpenFlags) -> Result<Box<dyn DriverState>> {
        Ok(Box::new(RawFileDisk::open(filename, flags)?))
    }
}

pub(crate) fn strip_file_prefix(filename: &str) -> &str {
    filename.strip_prefix("file:").unwrap_or(filename)
}

/// Heap buffer aligned for `O_DIRECT` transfers.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), DIRECT_IO_ALIGNMENT)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::Io(io::Error::from(io::ErrorKind::OutOfMemory)));
        }
        Ok(AlignedBuf { ptr, layout })
    }

    fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        // SAFETY: ptr points to layout.size() initialized bytes owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, len.min(self.layout.size())) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated by alloc_zeroed with the same layout.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Open raw file. Short transfers are retried until complete, and reads
/// past the end of the file return zeroes.
pub struct RawFileDisk {
    file: File,
    direct: bool,
}

impl RawFileDisk {
    pub fn open(filename: &str, flags: OpenFlags) -> Result<Self> {
        let path = strip_file_prefix(filename);
        let writable = flags.intersects(OpenFlags::RDWR | OpenFlags::CREAT);
        let direct = flags.contains(OpenFlags::NOCACHE);

        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(writable)
            .create(flags.contains(OpenFlags::CREAT));
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path).map_err(Error::Io)?;

        debug!("Opened raw file {path} writable {writable} direct {direct}");
        Ok(RawFileDisk { file, direct })
    }

    fn pread_all(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let rest = &mut buf[done..];
            // SAFETY: FFI call with a valid fd and a buffer of rest.len() bytes.
            let ret = unsafe {
                libc::pread(
                    self.file.as_raw_fd(),
                    rest.as_mut_ptr() as *mut libc::c_void,
                    rest.len(),
                    (offset + done as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                rest.fill(0);
                break;
            }
            done += ret as usize;
        }
        Ok(())
    }

    fn pwrite_all(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let rest = &buf[done..];
            // SAFETY: FFI call with a valid fd and a buffer of rest.len() bytes.
            let ret = unsafe {
                libc::pwrite(
                    self.file.as_raw_fd(),
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    (offset + done as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            done += ret as usize;
        }
        Ok(())
    }

    // Reads into an aligned buffer at an aligned offset. A short read
    // means end of file, the rest of the buffer is zero filled.
    fn pread_direct(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let rest = &mut buf[done..];
            // SAFETY: FFI call with a valid fd and a buffer of rest.len() bytes.
            let ret = unsafe {
                libc::pread(
                    self.file.as_raw_fd(),
                    rest.as_mut_ptr() as *mut libc::c_void,
                    rest.len(),
                    (offset + done as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            done += ret as usize;
            if ret == 0 || done % DIRECT_IO_ALIGNMENT != 0 {
                buf[done..].fill(0);
                break;
            }
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at byte `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if !self.direct {
            return self.pread_all(offset, buf).map_err(Error::Io);
        }
        let start = round_down(offset);
        let head = (offset - start) as usize;
        let len = round_up(head + buf.len());

        let mut bounce = AlignedBuf::new(len)?;
        let tmp = bounce.as_mut_slice(len);
        self.pread_direct(start, tmp).map_err(Error::Io)?;
        buf.copy_from_slice(&tmp[head..head + buf.len()]);
        Ok(())
    }

    /// Writes `buf` at byte `offset`. With `O_DIRECT`, partial blocks at
    /// either end are read, patched and written back whole.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.direct {
            return self.pwrite_all(offset, buf).map_err(Error::Io);
        }
        let start = round_down(offset);
        let head = (offset - start) as usize;
        let len = round_up(head + buf.len());
        let end = offset + buf.len() as u64;

        let mut bounce = AlignedBuf::new(len)?;
        let tmp = bounce.as_mut_slice(len);
        if head != 0 || len != buf.len() {
            self.pread_direct(start, tmp).map_err(Error::Io)?;
        }
        tmp[head..head + buf.len()].copy_from_slice(buf);

        let file_len = self.file.metadata().map_err(Error::Io)?.len();
        self.pwrite_all(start, tmp).map_err(Error::Io)?;

        // The padded tail must not grow the file past the bytes written.
        if start + len as u64 > end.max(file_len) && !self.is_block_device() {
            self.file.set_len(end.max(file_len)).map_err(Error::Io)?;
        }
        Ok(())
    }

    fn is_block_device(&self) -> bool {
        match self.file.metadata() {
            Ok(m) => m.file_type().is_block_device(),
            Err(e) => {
                warn!("Unable to stat image file: {e}");
                false
            }
        }
    }
}

impl DriverState for RawFileDisk {
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(sector * SECTOR_SIZE, buf)
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        self.write_at(sector * SECTOR_SIZE, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all().map_err(Error::Io)
    }

    fn length(&mut self) -> Result<u64> {
        self.file.seek(SeekFrom::End(0)).map_err(Error::Io)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if self.is_block_device() {
            return Err(Error::NotSupported("truncate"));
        }
        self.file.set_len(size).map_err(Error::Io)
    }

    fn has_zero_init(&self) -> bool {
        !self.is_block_device()
    }
}

#[cfg(test)]
mod unit_tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_raw_read_write() {
        let temp = TempFile::new().unwrap();
        temp.as_file().set_len(8 * SECTOR_SIZE).unwrap();
        let path = temp.as_path().to_str().unwrap();

        let mut disk = RawDriver.open(path, OpenFlags::RDWR).unwrap();
        assert_eq!(disk.length().unwrap(), 8 * SECTOR_SIZE);
        assert!(disk.has_zero_init());

        disk.write(2, &[0x5a; 1024]).unwrap();
        let mut buf = vec![0u8; 2048];
        disk.read(1, &mut buf).unwrap();
        assert!(buf[..512].iter().all(|b| *b == 0));
        assert!(buf[512..1536].iter().all(|b| *b == 0x5a));
        assert!(buf[1536..].iter().all(|b| *b == 0));
        disk.flush().unwrap();

        // Past the end of file reads as zeroes.
        let mut buf = vec![0xffu8; 1024];
        disk.read(7, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        disk.truncate(16 * SECTOR_SIZE).unwrap();
        assert_eq!(disk.length().unwrap(), 16 * SECTOR_SIZE);
    }

    #[test]
    fn test_raw_direct_unaligned() {
        let temp = TempFile::new().unwrap();
        std::fs::write(temp.as_path(), vec![0x3cu8; 1500]).unwrap();
        let path = temp.as_path().to_str().unwrap();

        let disk = RawFileDisk::open(path, OpenFlags::RDWR | OpenFlags::NOCACHE).unwrap();
        let mut buf = vec![0u8; 1048];
        disk.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0x3c));

        disk.write_at(1030, &[0x7e; 20]).unwrap();
        assert_eq!(temp.as_file().metadata().unwrap().len(), 1500);
        disk.write_at(1490, &[0x7e; 20]).unwrap();
        assert_eq!(temp.as_file().metadata().unwrap().len(), 1510);

        let mut buf = vec![0u8; 600];
        disk.read_at(1000, &mut buf).unwrap();
        assert!(buf[..30].iter().all(|b| *b == 0x3c));
        assert!(buf[30..50].iter().all(|b| *b == 0x7e));
        assert!(buf[50..490].iter().all(|b| *b == 0x3c));
        assert!(buf[490..510].iter().all(|b| *b == 0x7e));
        assert!(buf[510..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_raw_read_only() {
        let temp = TempFile::new().unwrap();
        temp.as_file().set_len(SECTOR_SIZE).unwrap();
        let path = format!("file:{}", temp.as_path().to_str().unwrap());

        let mut disk = RawDriver.open(&path, OpenFlags::empty()).unwrap();
        let err = disk.write(0, &[1; 512]).unwrap_err();
        assert_eq!(err.errno(), -libc::EBADF);
    }

    #[test]
    fn test_raw_create() {
        let temp = TempFile::new().unwrap();
        let path = temp.as_path().to_str().unwrap();
        RawDriver.create(path, 1 << 20, None).unwrap();
        assert_eq!(temp.as_file().metadata().unwrap().len(), 1 << 20);

        let backing = BackingFile {
            filename: "/tmp/base".to_owned(),
            format: None,
        };
        assert!(matches!(
            RawDriver.create(path, 1 << 20, Some(&backing)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
