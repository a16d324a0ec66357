// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Copy-on-write overlay format.
//!
//! The image starts with a big-endian header naming the backing file,
//! followed by a bitmap holding one bit per sector (set when the sector is
//! stored in the overlay) and then the sector data at its natural offset,
//! aligned to the next sector boundary after the bitmap.

use std::fs;
use std::io::Cursor;
use std::time::UNIX_EPOCH;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::driver::{BackingFile, BlockDriver, DriverState};
use crate::raw::{strip_file_prefix, RawFileDisk};
use crate::{protocol_prefix, Error, OpenFlags, Result, SECTOR_SIZE};

pub const COW_MAGIC: u32 = 0x4f4f_4f4d;
pub const COW_VERSION: u32 = 2;

const BACKING_FILE_LEN: usize = 1024;
const HEADER_SIZE: u64 = 4 + 4 + BACKING_FILE_LEN as u64 + 4 + 8 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
struct CowHeader {
    backing_file: String,
    mtime: u32,
    size: u64,
    sectorsize: u32,
}

impl CowHeader {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.backing_file.len() >= BACKING_FILE_LEN {
            return Err(Error::InvalidArgument(format!(
                "backing file name {} is too long",
                self.backing_file
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        let mut name = [0u8; BACKING_FILE_LEN];
        name[..self.backing_file.len()].copy_from_slice(self.backing_file.as_bytes());

        buf.write_u32::<BigEndian>(COW_MAGIC).map_err(Error::Io)?;
        buf.write_u32::<BigEndian>(COW_VERSION).map_err(Error::Io)?;
        buf.extend_from_slice(&name);
        buf.write_u32::<BigEndian>(self.mtime).map_err(Error::Io)?;
        buf.write_u64::<BigEndian>(self.size).map_err(Error::Io)?;
        buf.write_u32::<BigEndian>(self.sectorsize).map_err(Error::Io)?;
        Ok(buf)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        let invalid = |what: &str| Error::InvalidArgument(format!("not a cow image: {what}"));

        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
        let version = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
        if magic != COW_MAGIC {
            return Err(invalid("bad magic"));
        }
        if version != COW_VERSION {
            return Err(invalid("unsupported version"));
        }

        let name = &buf[8..8 + BACKING_FILE_LEN];
        let end = name.iter().position(|b| *b == 0).unwrap_or(BACKING_FILE_LEN);
        let backing_file = String::from_utf8(name[..end].to_vec())
            .map_err(|_| invalid("backing file name is not UTF-8"))?;

        cursor.set_position(8 + BACKING_FILE_LEN as u64);
        let mtime = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
        let size = cursor.read_u64::<BigEndian>().map_err(Error::Io)?;
        let sectorsize = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
        if u64::from(sectorsize) != SECTOR_SIZE {
            return Err(invalid("unsupported sector size"));
        }

        Ok(CowHeader {
            backing_file,
            mtime,
            size,
            sectorsize,
        })
    }

    fn bitmap_size(&self) -> u64 {
        self.size.div_ceil(SECTOR_SIZE).div_ceil(8)
    }

    fn data_offset(&self) -> u64 {
        (HEADER_SIZE + self.bitmap_size()).next_multiple_of(SECTOR_SIZE)
    }
}

fn backing_mtime(backing: &str) -> u32 {
    if protocol_prefix(backing).is_some_and(|p| p != "file") {
        return 0;
    }
    fs::metadata(strip_file_prefix(backing))
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as u32)
}

pub struct CowDriver;

impl BlockDriver for CowDriver {
    fn format_name(&self) -> &'static str {
        "cow"
    }

    fn probe(&self, buf: &[u8], _filename: &str) -> u32 {
        if buf.len() < 8 {
            return 0;
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if magic == COW_MAGIC && version == COW_VERSION {
            100
        } else {
            0
        }
    }

    fn can_create(&self) -> bool {
        true
    }

    fn create(&self, filename: &str, size: u64, backing: Option<&BackingFile>) -> Result<()> {
        let backing_file = backing.map(|b| b.filename.clone()).unwrap_or_default();
        let header = CowHeader {
            mtime: backing_mtime(&backing_file),
            backing_file,
            size,
            sectorsize: SECTOR_SIZE as u32,
        };

        let mut file = RawFileDisk::open(filename, OpenFlags::RDWR | OpenFlags::CREAT)?;
        file.truncate(0)?;
        file.truncate(header.data_offset())?;
        file.write_at(0, &header.to_bytes()?)?;
        file.flush()?;

        debug!("Created cow image {filename} of {size} bytes");
        Ok(())
    }

    fn open(&self, filename: &str, flags: OpenFlags) -> Result<Box<dyn DriverState>> {
        Ok(Box::new(CowImage::open(filename, flags)?))
    }
}

/// An opened cow image.
pub struct CowImage {
    file: RawFileDisk,
    header: CowHeader,
    bitmap: Vec<u8>,
    data_offset: u64,
}

impl CowImage {
    pub fn open(filename: &str, flags: OpenFlags) -> Result<Self> {
        let file = RawFileDisk::open(filename, flags & !OpenFlags::CREAT)?;

        let mut buf = vec![0u8; HEADER_SIZE as usize];
        file.read_at(0, &mut buf)?;
        let header = CowHeader::from_bytes(&buf)?;

        let mut bitmap = vec![0u8; header.bitmap_size() as usize];
        file.read_at(HEADER_SIZE, &mut bitmap)?;

        Ok(CowImage {
            file,
            data_offset: header.data_offset(),
            header,
            bitmap,
        })
    }

    fn is_set(&self, sector: u64) -> bool {
        self.bitmap[(sector / 8) as usize] & (1 << (sector % 8)) != 0
    }

    fn set_bits(&mut self, sector: u64, nb_sectors: u64) -> Result<()> {
        if nb_sectors == 0 {
            return Ok(());
        }
        for s in sector..sector + nb_sectors {
            self.bitmap[(s / 8) as usize] |= 1 << (s % 8);
        }
        let first = (sector / 8) as usize;
        let last = ((sector + nb_sectors - 1) / 8) as usize;
        self.file
            .write_at(HEADER_SIZE + first as u64, &self.bitmap[first..=last])
    }

    fn check_range(&self, sector: u64, nb_sectors: u64) -> Result<()> {
        let total = self.header.size / SECTOR_SIZE;
        if sector.checked_add(nb_sectors).is_none_or(|end| end > total) {
            return Err(Error::BoundsViolation {
                sector,
                nb_sectors,
                total_sectors: total,
            });
        }
        Ok(())
    }
}

impl DriverState for CowImage {
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let nb_sectors = buf.len() as u64 / SECTOR_SIZE;
        self.check_range(sector, nb_sectors)?;

        let mut done = 0;
        while done < nb_sectors {
            let (allocated, n) = self.is_allocated(sector + done, nb_sectors - done)?;
            let chunk =
                &mut buf[(done * SECTOR_SIZE) as usize..((done + n) * SECTOR_SIZE) as usize];
            if allocated {
                self.file
                    .read_at(self.data_offset + (sector + done) * SECTOR_SIZE, chunk)?;
            } else {
                chunk.fill(0);
            }
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let nb_sectors = buf.len() as u64 / SECTOR_SIZE;
        self.check_range(sector, nb_sectors)?;

        self.file.write_at(self.data_offset + sector * SECTOR_SIZE, buf)?;
        self.set_bits(sector, nb_sectors)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    fn length(&mut self) -> Result<u64> {
        Ok(self.header.size)
    }

    fn is_allocated(&mut self, sector: u64, nb_sectors: u64) -> Result<(bool, u64)> {
        let total = self.header.size / SECTOR_SIZE;
        if nb_sectors == 0 || sector >= total {
            return Ok((false, 0));
        }
        let nb_sectors = nb_sectors.min(total - sector);

        let allocated = self.is_set(sector);
        let mut n = 1;
        while n < nb_sectors && self.is_set(sector + n) == allocated {
            n += 1;
        }
        Ok((allocated, n))
    }

    fn backing_file(&self) -> Option<BackingFile> {
        if self.header.backing_file.is_empty() {
            return None;
        }
        Some(BackingFile {
            filename: self.header.backing_file.clone(),
            format: None,
        })
    }

    fn change_backing_file(&mut self, backing: Option<&BackingFile>) -> Result<()> {
        let mut header = self.header.clone();
        header.backing_file = backing.map(|b| b.filename.clone()).unwrap_or_default();
        header.mtime = backing_mtime(&header.backing_file);

        self.file.write_at(0, &header.to_bytes()?)?;
        self.file.flush()?;
        self.header = header;
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn create_cow(size: u64, backing: Option<&str>) -> TempFile {
        let temp = TempFile::new().unwrap();
        let backing = backing.map(|b| BackingFile {
            filename: b.to_owned(),
            format: None,
        });
        CowDriver
            .create(temp.as_path().to_str().unwrap(), size, backing.as_ref())
            .unwrap();
        temp
    }

    #[test]
    fn test_header_layout() {
        let header = CowHeader {
            backing_file: "base.img".to_owned(),
            mtime: 7,
            size: 1 << 20,
            sectorsize: 512,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, HEADER_SIZE);
        assert_eq!(&bytes[..4], &[0x4f, 0x4f, 0x4f, 0x4d]);
        assert_eq!(&bytes[8..16], b"base.img");
        assert_eq!(CowHeader::from_bytes(&bytes).unwrap(), header);

        // 2048 sectors need 256 bitmap bytes, data starts on the next sector.
        assert_eq!(header.bitmap_size(), 256);
        assert_eq!(header.data_offset(), 1536);

        let too_long = CowHeader {
            backing_file: "x".repeat(BACKING_FILE_LEN),
            ..header
        };
        assert!(too_long.to_bytes().is_err());
    }

    #[test]
    fn test_reject_foreign_image() {
        let temp = TempFile::new().unwrap();
        temp.as_file().set_len(4096).unwrap();
        let path = temp.as_path().to_str().unwrap();
        assert!(matches!(
            CowDriver.open(path, OpenFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(CowDriver.probe(&[0u8; 512], path), 0);
    }

    #[test]
    fn test_allocation_bitmap() {
        let temp = create_cow(64 * SECTOR_SIZE, Some("base.img"));
        let path = temp.as_path().to_str().unwrap();

        let mut image = CowDriver.open(path, OpenFlags::RDWR).unwrap();
        assert_eq!(image.length().unwrap(), 64 * SECTOR_SIZE);
        assert_eq!(image.backing_file().unwrap().filename, "base.img");
        assert_eq!(image.is_allocated(0, 64).unwrap(), (false, 64));

        image.write(5, &[0xcd; 3 * 512]).unwrap();
        assert_eq!(image.is_allocated(0, 64).unwrap(), (false, 5));
        assert_eq!(image.is_allocated(5, 64).unwrap(), (true, 3));
        assert_eq!(image.is_allocated(6, 1).unwrap(), (true, 1));
        assert_eq!(image.is_allocated(8, 64).unwrap(), (false, 56));
        assert_eq!(image.is_allocated(64, 1).unwrap(), (false, 0));

        let mut buf = vec![0xffu8; 5 * 512];
        image.read(4, &mut buf).unwrap();
        assert!(buf[..512].iter().all(|b| *b == 0));
        assert!(buf[512..2048].iter().all(|b| *b == 0xcd));
        assert!(buf[2048..].iter().all(|b| *b == 0));

        assert!(matches!(
            image.write(63, &[0; 1024]),
            Err(Error::BoundsViolation { .. })
        ));
        drop(image);

        // The bitmap is persistent.
        let mut image = CowDriver.open(path, OpenFlags::empty()).unwrap();
        assert_eq!(image.is_allocated(5, 64).unwrap(), (true, 3));
    }

    #[test]
    fn test_change_backing_file() {
        let temp = create_cow(8 * SECTOR_SIZE, Some("mid.cow"));
        let path = temp.as_path().to_str().unwrap();

        let mut image = CowDriver.open(path, OpenFlags::RDWR).unwrap();
        image.write(0, &[1; 512]).unwrap();
        let base = BackingFile {
            filename: "base.img".to_owned(),
            format: Some("raw".to_owned()),
        };
        image.change_backing_file(Some(&base)).unwrap();
        assert_eq!(image.backing_file().unwrap().filename, "base.img");
        drop(image);

        let mut image = CowDriver.open(path, OpenFlags::RDWR).unwrap();
        assert_eq!(image.backing_file().unwrap().filename, "base.img");
        assert_eq!(image.is_allocated(0, 8).unwrap(), (true, 1));

        image.change_backing_file(None).unwrap();
        assert!(image.backing_file().is_none());
    }
}
