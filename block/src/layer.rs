// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::env;
use std::fs::{self, File};
use std::io::{self, Read};
use std::rc::Rc;

use log::{debug, info, warn};
use vmm_sys_util::tempfile::TempFile;

use crate::aio::AioPool;
use crate::clock::{Clock, HostClock};
use crate::driver::{BackingFile, BlockDriver, DriverState};
use crate::job::BlockJob;
use crate::registry::DriverRegistry;
use crate::stats::{BlockAcctStats, BlockAcctType, BlockErrorAction, BlockdevOnError, IoStatus};
use crate::{path_combine, protocol_prefix, Error, OpenFlags, Result, SECTOR_SIZE};

/// Longest backing chain accepted when opening an image.
pub const MAX_BACKING_DEPTH: usize = 64;

const PROBE_BUF_SIZE: u64 = 2048;

/// Reference to an open block handle. Ids of closed handles are never
/// reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

pub(crate) struct BlockDriverState {
    pub(crate) device_name: String,
    filename: String,
    driver: Rc<dyn BlockDriver>,
    pub(crate) opaque: Box<dyn DriverState>,
    open_flags: OpenFlags,
    pub(crate) total_sectors: u64,
    read_only: bool,
    growable: bool,
    locked: bool,
    tray_open: bool,
    backing: Option<BackingFile>,
    pub(crate) backing_hd: Option<HandleId>,
    copy_on_read: u32,
    stats: BlockAcctStats,
    geometry: Option<Geometry>,
    on_read_error: BlockdevOnError,
    on_write_error: BlockdevOnError,
    iostatus: IoStatus,
    pub(crate) in_flight: u32,
    pub(crate) job: Option<BlockJob>,
    overlay: Option<TempFile>,
}

struct Slot {
    generation: u32,
    bs: Option<BlockDriverState>,
}

/// Owner of every open image, the AIO pool and the attached block jobs.
pub struct BlockLayer {
    registry: DriverRegistry,
    clock: Rc<dyn Clock>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    pub(crate) aio: AioPool,
}

fn sectors_in(len: usize) -> Result<u64> {
    if len as u64 % SECTOR_SIZE != 0 {
        return Err(Error::InvalidArgument(format!(
            "buffer of {len} bytes is not sector aligned"
        )));
    }
    Ok(len as u64 / SECTOR_SIZE)
}

fn strip_protocol(filename: &str) -> &str {
    match protocol_prefix(filename) {
        Some(p) => &filename[p.len() + 1..],
        None => filename,
    }
}

// Identity of an image within a backing chain.
fn canonical_name(filename: &str) -> String {
    fs::canonicalize(strip_protocol(filename))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| filename.to_owned())
}

fn absolute_name(filename: &str) -> String {
    if protocol_prefix(filename).is_some() {
        return filename.to_owned();
    }
    fs::canonicalize(filename)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| filename.to_owned())
}

impl BlockLayer {
    pub fn new(registry: DriverRegistry) -> Result<Self> {
        Self::with_clock(registry, Rc::new(HostClock::new()))
    }

    pub fn with_clock(registry: DriverRegistry, clock: Rc<dyn Clock>) -> Result<Self> {
        Ok(BlockLayer {
            registry,
            clock,
            slots: Vec::new(),
            free: Vec::new(),
            aio: AioPool::new()?,
        })
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn try_bs(&self, id: HandleId) -> Option<&BlockDriverState> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.bs.as_ref())
    }

    pub(crate) fn try_bs_mut(&mut self, id: HandleId) -> Option<&mut BlockDriverState> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.bs.as_mut())
    }

    pub(crate) fn bs(&self, id: HandleId) -> &BlockDriverState {
        match self.try_bs(id) {
            Some(bs) => bs,
            None => panic!("use of closed block handle {id:?}"),
        }
    }

    pub(crate) fn bs_mut(&mut self, id: HandleId) -> &mut BlockDriverState {
        match self.try_bs_mut(id) {
            Some(bs) => bs,
            None => panic!("use of closed block handle {id:?}"),
        }
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.bs.as_ref().map(|_| HandleId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    fn insert(&mut self, bs: BlockDriverState) -> HandleId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.bs = Some(bs);
            return HandleId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            bs: Some(bs),
        });
        HandleId {
            index: self.slots.len() as u32 - 1,
            generation: 0,
        }
    }

    fn remove(&mut self, id: HandleId) -> BlockDriverState {
        let Some(slot) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
        else {
            panic!("use of closed block handle {id:?}");
        };
        let Some(bs) = slot.bs.take() else {
            panic!("use of closed block handle {id:?}");
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        bs
    }

    pub fn is_open(&self, id: HandleId) -> bool {
        self.try_bs(id).is_some()
    }

    fn find_image_driver(
        &self,
        filename: &str,
        flags: OpenFlags,
        explicit: Option<&str>,
    ) -> Result<Rc<dyn BlockDriver>> {
        if let Some(name) = explicit {
            return self
                .registry
                .find(name)
                .ok_or_else(|| Error::NotFound(name.to_owned()));
        }

        if let Some(driver) = self.registry.find_protocol(filename) {
            if driver.protocol_name() != Some("file") {
                return Ok(driver);
            }
        }

        if flags.contains(OpenFlags::NO_PROBE) {
            return self
                .registry
                .find("file")
                .ok_or_else(|| Error::NotFound("file".to_owned()));
        }

        let mut buf = Vec::new();
        match File::open(strip_protocol(filename)) {
            Ok(file) => {
                file.take(PROBE_BUF_SIZE)
                    .read_to_end(&mut buf)
                    .map_err(Error::Io)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && flags.contains(OpenFlags::CREAT) => {}
            Err(e) => return Err(Error::Io(e)),
        }

        self.registry
            .probe(&buf, filename)
            .ok_or_else(|| Error::NotFound(format!("no driver recognizes {filename}")))
    }

    fn open_common(
        &mut self,
        filename: &str,
        flags: OpenFlags,
        driver: Rc<dyn BlockDriver>,
    ) -> Result<HandleId> {
        if flags.contains(OpenFlags::CREAT) && !driver.can_create() {
            return Err(Error::InvalidOperation(format!(
                "the {} driver cannot create images",
                driver.format_name()
            )));
        }

        let mut opaque = driver.open(filename, flags)?;
        let length = match opaque.length() {
            Ok(length) => length,
            Err(e) => {
                opaque.close();
                return Err(e);
            }
        };
        let backing = opaque.backing_file();

        debug!(
            "Opened {filename} with the {} driver, {length} bytes",
            driver.format_name()
        );

        Ok(self.insert(BlockDriverState {
            device_name: String::new(),
            filename: filename.to_owned(),
            driver,
            opaque,
            open_flags: flags,
            total_sectors: length / SECTOR_SIZE,
            read_only: !flags.contains(OpenFlags::RDWR),
            growable: false,
            locked: false,
            tray_open: false,
            backing,
            backing_hd: None,
            copy_on_read: 0,
            stats: BlockAcctStats::default(),
            geometry: None,
            on_read_error: BlockdevOnError::default(),
            on_write_error: BlockdevOnError::default(),
            iostatus: IoStatus::Ok,
            in_flight: 0,
            job: None,
            overlay: None,
        }))
    }

    // Opens the backing file recorded in `id`, and recursively its own.
    fn open_backing(
        &mut self,
        id: HandleId,
        flags: OpenFlags,
        chain: &mut Vec<String>,
    ) -> Result<()> {
        if flags.contains(OpenFlags::NO_BACKING) {
            return Ok(());
        }
        let Some(backing) = self.bs(id).backing.clone() else {
            return Ok(());
        };

        let filename = path_combine(&self.bs(id).filename, &backing.filename);
        let backing_flags = flags
            & !(OpenFlags::RDWR | OpenFlags::SNAPSHOT | OpenFlags::CREAT | OpenFlags::COPY_ON_READ);
        let driver = self.find_image_driver(&filename, backing_flags, backing.format.as_deref())?;
        let backing_hd = self.open_chain(&filename, backing_flags, driver, chain)?;
        self.bs_mut(id).backing_hd = Some(backing_hd);
        Ok(())
    }

    fn open_chain(
        &mut self,
        filename: &str,
        flags: OpenFlags,
        driver: Rc<dyn BlockDriver>,
        chain: &mut Vec<String>,
    ) -> Result<HandleId> {
        if chain.len() >= MAX_BACKING_DEPTH {
            return Err(Error::InvalidArgument(format!(
                "backing chain of {filename} is deeper than {MAX_BACKING_DEPTH} images"
            )));
        }
        let name = canonical_name(filename);
        if chain.contains(&name) {
            return Err(Error::InvalidArgument(format!(
                "backing chain loops back to {filename}"
            )));
        }
        chain.push(name);

        let id = self.open_common(filename, flags, driver)?;
        if let Err(e) = self.open_backing(id, flags, chain) {
            warn!("Could not open the backing file of {filename}: {e}");
            self.close(id);
            return Err(e);
        }
        if flags.contains(OpenFlags::COPY_ON_READ) {
            self.enable_copy_on_read(id);
        }
        Ok(id)
    }

    fn open_snapshot(
        &mut self,
        filename: &str,
        flags: OpenFlags,
        driver: Option<&str>,
    ) -> Result<HandleId> {
        let base_flags = flags & !(OpenFlags::SNAPSHOT | OpenFlags::RDWR | OpenFlags::CREAT);
        let base_driver = self.find_image_driver(filename, base_flags, driver)?;
        let format = base_driver.format_name();

        let base = self.open_chain(filename, base_flags, base_driver, &mut Vec::new())?;
        let size = self.getlength(base);
        self.close(base);
        let size = size?;

        let overlay = TempFile::new_with_prefix(env::temp_dir().join("vl."))
            .map_err(|e| Error::Io(io::Error::from_raw_os_error(e.errno())))?;
        let overlay_name = overlay
            .as_path()
            .to_str()
            .ok_or_else(|| Error::InvalidArgument("temporary path is not UTF-8".to_owned()))?
            .to_owned();

        let cow = self
            .registry
            .find("cow")
            .ok_or_else(|| Error::NotFound("cow".to_owned()))?;
        let backing = BackingFile {
            filename: absolute_name(filename),
            format: Some(format.to_owned()),
        };
        cow.create(&overlay_name, size, Some(&backing))?;

        let overlay_flags = (flags & !(OpenFlags::SNAPSHOT | OpenFlags::CREAT)) | OpenFlags::RDWR;
        let id = self.open_common(&overlay_name, overlay_flags, cow)?;
        // The overlay header cannot carry the format, keep it from the probe.
        self.bs_mut(id).backing = Some(backing);
        self.bs_mut(id).overlay = Some(overlay);

        let mut chain = vec![canonical_name(&overlay_name)];
        if let Err(e) = self.open_backing(id, overlay_flags, &mut chain) {
            self.close(id);
            return Err(e);
        }
        if flags.contains(OpenFlags::COPY_ON_READ) {
            self.enable_copy_on_read(id);
        }

        debug!("Redirecting writes to {filename} into {overlay_name}");
        Ok(id)
    }

    /// Opens an image, resolving its driver from `driver`, a protocol
    /// prefix or the image content, together with its backing chain.
    pub fn open(
        &mut self,
        device_name: &str,
        filename: &str,
        flags: OpenFlags,
        driver: Option<&str>,
    ) -> Result<HandleId> {
        if !device_name.is_empty() && self.find(device_name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "duplicate device name {device_name}"
            )));
        }

        let id = if flags.contains(OpenFlags::SNAPSHOT) {
            self.open_snapshot(filename, flags, driver)?
        } else {
            let image_driver = self.find_image_driver(filename, flags, driver)?;
            self.open_chain(filename, flags, image_driver, &mut Vec::new())?
        };

        let bs = self.bs_mut(id);
        bs.device_name = device_name.to_owned();
        info!(
            "Opened {filename} as {} ({}, {} sectors, {})",
            if device_name.is_empty() { "-" } else { device_name },
            bs.driver.format_name(),
            bs.total_sectors,
            if bs.read_only { "read-only" } else { "read-write" }
        );
        Ok(id)
    }

    /// Opens `filename` at the protocol level: no probing, no backing file,
    /// and writes may extend the file.
    pub fn open_file(&mut self, filename: &str, flags: OpenFlags) -> Result<HandleId> {
        let driver = match self.registry.find_protocol(filename) {
            Some(driver) => driver,
            None => self
                .registry
                .find("file")
                .ok_or_else(|| Error::NotFound("file".to_owned()))?,
        };
        let id = self.open_common(filename, flags, driver)?;
        self.bs_mut(id).growable = true;
        Ok(id)
    }

    /// Creates a new image of `size` bytes with the named driver.
    pub fn create(
        &self,
        driver: &str,
        filename: &str,
        size: u64,
        backing: Option<&BackingFile>,
    ) -> Result<()> {
        let drv = self
            .registry
            .find(driver)
            .ok_or_else(|| Error::NotFound(driver.to_owned()))?;
        if !drv.can_create() {
            return Err(Error::InvalidOperation(format!(
                "the {driver} driver cannot create images"
            )));
        }
        drv.create(filename, size, backing)
    }

    /// Closes the handle and its whole backing chain. An attached job is
    /// cancelled and waited for first.
    pub fn close(&mut self, id: HandleId) {
        if self.bs(id).job.is_some() {
            if let Err(e) = self.job_cancel_sync(id) {
                warn!("Failed to cancel block job before close: {e}");
            }
        }
        if self.bs(id).in_flight > 0 {
            self.drain_all();
        }

        let mut bs = self.remove(id);
        if !bs.read_only {
            if let Err(e) = bs.opaque.flush() {
                warn!("Failed to flush {} on close: {e}", bs.filename);
            }
        }
        bs.opaque.close();
        debug!("Closed {}", bs.filename);

        if let Some(backing_hd) = bs.backing_hd.take() {
            if self.is_open(backing_hd) {
                self.close(backing_hd);
            }
        }
    }

    pub fn find(&self, device_name: &str) -> Option<HandleId> {
        self.handles()
            .find(|id| self.bs(*id).device_name == device_name)
    }

    /// Handles opened with a device name, in slot order.
    pub fn devices(&self) -> Vec<HandleId> {
        self.handles()
            .filter(|id| !self.bs(*id).device_name.is_empty())
            .collect()
    }

    pub fn device_name(&self, id: HandleId) -> &str {
        &self.bs(id).device_name
    }

    pub fn filename(&self, id: HandleId) -> &str {
        &self.bs(id).filename
    }

    pub fn format_name(&self, id: HandleId) -> &'static str {
        self.bs(id).driver.format_name()
    }

    pub fn open_flags(&self, id: HandleId) -> OpenFlags {
        self.bs(id).open_flags
    }

    pub fn total_sectors(&self, id: HandleId) -> u64 {
        self.bs(id).total_sectors
    }

    /// Image length in bytes. Growable images are asked for their current
    /// length.
    pub fn getlength(&mut self, id: HandleId) -> Result<u64> {
        let bs = self.bs_mut(id);
        if bs.growable {
            let length = bs.opaque.length()?;
            bs.total_sectors = length / SECTOR_SIZE;
        }
        Ok(bs.total_sectors * SECTOR_SIZE)
    }

    pub fn truncate(&mut self, id: HandleId, size: u64) -> Result<()> {
        let bs = self.bs_mut(id);
        if bs.read_only {
            return Err(Error::ReadOnly);
        }
        if bs.job.is_some() {
            return Err(Error::Busy);
        }
        bs.opaque.truncate(size)?;
        bs.total_sectors = bs.opaque.length()? / SECTOR_SIZE;
        Ok(())
    }

    pub fn geometry_hint(&self, id: HandleId) -> Option<Geometry> {
        self.bs(id).geometry
    }

    pub fn set_geometry_hint(&mut self, id: HandleId, geometry: Geometry) {
        self.bs_mut(id).geometry = Some(geometry);
    }

    /// Geometry hint, or a translation of the image size to 16 heads and
    /// 63 sectors per track recorded as the new hint.
    pub fn guess_geometry(&mut self, id: HandleId) -> Geometry {
        let bs = self.bs_mut(id);
        if let Some(geometry) = bs.geometry {
            return geometry;
        }
        let cylinders = (bs.total_sectors / (16 * 63)).clamp(2, 16383) as u32;
        let geometry = Geometry {
            cylinders,
            heads: 16,
            sectors: 63,
        };
        bs.geometry = Some(geometry);
        geometry
    }

    pub fn is_inserted(&self, id: HandleId) -> bool {
        let bs = self.bs(id);
        !bs.tray_open && bs.opaque.is_inserted()
    }

    pub fn eject(&mut self, id: HandleId, open: bool) -> Result<()> {
        let bs = self.bs_mut(id);
        if bs.locked {
            return Err(Error::Busy);
        }
        bs.opaque.eject(open)?;
        bs.tray_open = open;
        Ok(())
    }

    pub fn set_locked(&mut self, id: HandleId, locked: bool) {
        let bs = self.bs_mut(id);
        bs.locked = locked;
        bs.opaque.set_locked(locked);
    }

    pub fn is_locked(&self, id: HandleId) -> bool {
        self.bs(id).locked
    }

    pub fn is_read_only(&self, id: HandleId) -> bool {
        self.bs(id).read_only
    }

    pub fn is_encrypted(&self, id: HandleId) -> bool {
        self.bs(id).opaque.is_encrypted()
    }

    pub fn has_zero_init(&self, id: HandleId) -> bool {
        self.bs(id).opaque.has_zero_init()
    }

    pub fn backing_hd(&self, id: HandleId) -> Option<HandleId> {
        self.bs(id).backing_hd
    }

    pub fn backing_filename(&self, id: HandleId) -> Option<&str> {
        self.bs(id).backing.as_ref().map(|b| b.filename.as_str())
    }

    /// Allocation status of `sector` in this image alone, and the length of
    /// the run sharing it, clamped to the end of the image.
    pub fn is_allocated(
        &mut self,
        id: HandleId,
        sector: u64,
        nb_sectors: u64,
    ) -> Result<(bool, u64)> {
        let bs = self.bs_mut(id);
        if sector >= bs.total_sectors {
            return Ok((false, 0));
        }
        let nb_sectors = nb_sectors.min(bs.total_sectors - sector);
        bs.opaque.is_allocated(sector, nb_sectors)
    }

    /// Whether `sector` is allocated in any image from `top` down to, but
    /// excluding, `base`.
    ///
    /// The returned run length is narrowed so that the answer holds for all
    /// of it.
    pub fn is_allocated_above(
        &mut self,
        top: Option<HandleId>,
        base: Option<HandleId>,
        sector: u64,
        nb_sectors: u64,
    ) -> Result<(bool, u64)> {
        let mut n = nb_sectors;
        let mut intermediate = top;
        while let Some(cur) = intermediate {
            if Some(cur) == base {
                break;
            }
            let (allocated, pnum) = self.is_allocated(cur, sector, n)?;
            if allocated {
                return Ok((true, pnum));
            }
            // Sectors past the end of a smaller image fall through to the
            // next one and do not limit the run.
            if pnum < n && sector + pnum < self.bs(cur).total_sectors {
                n = pnum;
            }
            intermediate = self.bs(cur).backing_hd;
        }
        Ok((false, n))
    }

    /// Rewrites the backing file reference of the image. Open handles are
    /// not relinked.
    pub fn change_backing_file(
        &mut self,
        id: HandleId,
        backing: Option<&BackingFile>,
    ) -> Result<()> {
        let bs = self.bs_mut(id);
        if bs.read_only {
            return Err(Error::ReadOnly);
        }
        bs.opaque.change_backing_file(backing)?;
        bs.backing = backing.cloned();
        info!(
            "Backing file of {} is now {}",
            bs.filename,
            backing.map_or("none", |b| b.filename.as_str())
        );
        Ok(())
    }

    // Closes the images between `top` and `base` and links `top` to `base`.
    pub(crate) fn release_intermediates(&mut self, top: HandleId, base: Option<HandleId>) {
        let mut cur = self.bs_mut(top).backing_hd.take();
        while let Some(id) = cur {
            if Some(id) == base {
                break;
            }
            cur = self.bs_mut(id).backing_hd.take();
            self.close(id);
        }
        self.bs_mut(top).backing_hd = base;
    }

    fn check_request(&self, id: HandleId, sector: u64, nb_sectors: u64) -> Result<()> {
        let bs = self.bs(id);
        if bs.tray_open || !bs.opaque.is_inserted() {
            return Err(Error::NoMedium);
        }
        if bs.growable {
            return Ok(());
        }
        if sector
            .checked_add(nb_sectors)
            .is_none_or(|end| end > bs.total_sectors)
        {
            return Err(Error::BoundsViolation {
                sector,
                nb_sectors,
                total_sectors: bs.total_sectors,
            });
        }
        Ok(())
    }

    pub(crate) fn check_read(&self, id: HandleId, sector: u64, len: usize) -> Result<()> {
        self.check_request(id, sector, sectors_in(len)?)
    }

    pub(crate) fn check_write(&self, id: HandleId, sector: u64, len: usize) -> Result<()> {
        let nb_sectors = sectors_in(len)?;
        if self.bs(id).read_only {
            return Err(Error::ReadOnly);
        }
        self.check_request(id, sector, nb_sectors)
    }

    fn read_backing(&mut self, backing_hd: HandleId, sector: u64, buf: &mut [u8]) -> Result<()> {
        let total_sectors = self.bs(backing_hd).total_sectors;
        if sector >= total_sectors {
            buf.fill(0);
            return Ok(());
        }
        let avail = (total_sectors - sector).min(buf.len() as u64 / SECTOR_SIZE);
        let (head, tail) = buf.split_at_mut((avail * SECTOR_SIZE) as usize);
        tail.fill(0);
        self.read_chain(backing_hd, sector, head, false)
    }

    fn read_chain(
        &mut self,
        id: HandleId,
        sector: u64,
        buf: &mut [u8],
        copy_on_read: bool,
    ) -> Result<()> {
        let Some(backing_hd) = self.bs(id).backing_hd else {
            return self.bs_mut(id).opaque.read(sector, buf);
        };

        let nb_sectors = buf.len() as u64 / SECTOR_SIZE;
        let mut done = 0;
        while done < nb_sectors {
            let cur = sector + done;
            let (allocated, n) = self
                .bs_mut(id)
                .opaque
                .is_allocated(cur, nb_sectors - done)?;
            let n = n.clamp(1, nb_sectors - done);
            let chunk =
                &mut buf[(done * SECTOR_SIZE) as usize..((done + n) * SECTOR_SIZE) as usize];

            if allocated {
                self.bs_mut(id).opaque.read(cur, chunk)?;
            } else {
                self.read_backing(backing_hd, cur, chunk)?;
                if copy_on_read && !self.bs(id).read_only {
                    self.bs_mut(id).opaque.write(cur, chunk)?;
                }
            }
            done += n;
        }
        Ok(())
    }

    pub(crate) fn read_accounted(
        &mut self,
        id: HandleId,
        sector: u64,
        buf: &mut [u8],
        copy_on_read: bool,
    ) -> Result<()> {
        let start = self.clock.now_ns();
        let res = self.read_chain(id, sector, buf, copy_on_read);
        let elapsed = self.clock.now_ns().saturating_sub(start);
        self.bs_mut(id)
            .stats
            .account(BlockAcctType::Read, buf.len() as u64, elapsed);
        res
    }

    pub(crate) fn write_accounted(&mut self, id: HandleId, sector: u64, buf: &[u8]) -> Result<()> {
        let start = self.clock.now_ns();
        let res = self.bs_mut(id).opaque.write(sector, buf);
        let elapsed = self.clock.now_ns().saturating_sub(start);

        let nb_sectors = buf.len() as u64 / SECTOR_SIZE;
        let bs = self.bs_mut(id);
        bs.stats
            .account(BlockAcctType::Write, buf.len() as u64, elapsed);
        if res.is_ok() && nb_sectors > 0 {
            let last = sector + nb_sectors - 1;
            bs.stats.wr_highest_sector = bs.stats.wr_highest_sector.max(last);
            if bs.growable && last >= bs.total_sectors {
                bs.total_sectors = last + 1;
            }
        }
        res
    }

    pub(crate) fn flush_accounted(&mut self, id: HandleId) -> Result<()> {
        let start = self.clock.now_ns();
        let res = self.bs_mut(id).opaque.flush();
        let elapsed = self.clock.now_ns().saturating_sub(start);
        self.bs_mut(id)
            .stats
            .account(BlockAcctType::Flush, 0, elapsed);
        res
    }

    /// Reads whole sectors starting at `sector`.
    pub fn read(&mut self, id: HandleId, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_read(id, sector, buf.len())?;
        let copy_on_read = self.bs(id).copy_on_read > 0;
        self.read_accounted(id, sector, buf, copy_on_read)
    }

    /// Writes whole sectors starting at `sector`.
    pub fn write(&mut self, id: HandleId, sector: u64, buf: &[u8]) -> Result<()> {
        self.check_write(id, sector, buf.len())?;
        self.write_accounted(id, sector, buf)
    }

    pub fn flush(&mut self, id: HandleId) -> Result<()> {
        self.flush_accounted(id)
    }

    /// Byte granular read.
    pub fn pread(&mut self, id: HandleId, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let first = offset / SECTOR_SIZE;
        let head = (offset % SECTOR_SIZE) as usize;
        if head == 0 && buf.len() as u64 % SECTOR_SIZE == 0 {
            return self.read(id, first, buf);
        }

        let last = (offset + buf.len() as u64).div_ceil(SECTOR_SIZE);
        let mut bounce = vec![0u8; ((last - first) * SECTOR_SIZE) as usize];
        self.read(id, first, &mut bounce)?;
        buf.copy_from_slice(&bounce[head..head + buf.len()]);
        Ok(())
    }

    /// Byte granular write. Partial sectors at either end are read, patched
    /// and written back.
    pub fn pwrite(&mut self, id: HandleId, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let first = offset / SECTOR_SIZE;
        let head = (offset % SECTOR_SIZE) as usize;
        if head == 0 && data.len() as u64 % SECTOR_SIZE == 0 {
            return self.write(id, first, data);
        }
        if self.bs(id).read_only {
            return Err(Error::ReadOnly);
        }

        let last = (offset + data.len() as u64).div_ceil(SECTOR_SIZE);
        let mut bounce = vec![0u8; ((last - first) * SECTOR_SIZE) as usize];
        self.read(id, first, &mut bounce)?;
        bounce[head..head + data.len()].copy_from_slice(data);
        self.write(id, first, &bounce)
    }

    /// Starts populating the image from its backing chain on every read.
    /// Calls nest.
    pub fn enable_copy_on_read(&mut self, id: HandleId) {
        self.bs_mut(id).copy_on_read += 1;
    }

    pub fn disable_copy_on_read(&mut self, id: HandleId) {
        let bs = self.bs_mut(id);
        assert!(bs.copy_on_read > 0, "copy-on-read is not enabled");
        bs.copy_on_read -= 1;
    }

    pub fn is_copy_on_read(&self, id: HandleId) -> bool {
        self.bs(id).copy_on_read > 0
    }

    pub fn stats(&self, id: HandleId) -> BlockAcctStats {
        self.bs(id).stats.clone()
    }

    pub fn set_on_error(
        &mut self,
        id: HandleId,
        on_read: BlockdevOnError,
        on_write: BlockdevOnError,
    ) {
        let bs = self.bs_mut(id);
        bs.on_read_error = on_read;
        bs.on_write_error = on_write;
    }

    /// Applies the error policy to a failed request and records a stop in
    /// the I/O status.
    pub fn error_action(&mut self, id: HandleId, is_read: bool, errno: i32) -> BlockErrorAction {
        let bs = self.bs_mut(id);
        let policy = if is_read {
            bs.on_read_error
        } else {
            bs.on_write_error
        };
        let action = policy.action(errno);
        if action == BlockErrorAction::Stop && bs.iostatus == IoStatus::Ok {
            bs.iostatus = if errno == -libc::ENOSPC {
                IoStatus::NoSpace
            } else {
                IoStatus::Failed
            };
        }
        debug!(
            "{} error {errno} on {}: {action:?}",
            if is_read { "Read" } else { "Write" },
            bs.filename
        );
        action
    }

    pub fn iostatus(&self, id: HandleId) -> IoStatus {
        self.bs(id).iostatus
    }

    pub fn iostatus_reset(&mut self, id: HandleId) {
        self.bs_mut(id).iostatus = IoStatus::Ok;
    }
}

#[cfg(test)]
pub(crate) mod unit_tests {
    use std::path::Path;

    use vmm_sys_util::tempdir::TempDir;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::clock::VirtualClock;

    pub(crate) fn path_str(path: &Path) -> String {
        path.to_str().unwrap().to_owned()
    }

    /// Raw image of `sectors` sectors, with each `(start, end, byte)` range
    /// of `fill` set to `byte`.
    pub(crate) fn raw_image(
        dir: &TempDir,
        name: &str,
        sectors: u64,
        fill: &[(u64, u64, u8)],
    ) -> String {
        let path = path_str(&dir.as_path().join(name));
        let mut data = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        for (start, end, byte) in fill {
            data[(start * SECTOR_SIZE) as usize..(end * SECTOR_SIZE) as usize].fill(*byte);
        }
        fs::write(&path, data).unwrap();
        path
    }

    /// Cow image over `backing`, with `fill` written into it.
    pub(crate) fn cow_image(
        dir: &TempDir,
        name: &str,
        sectors: u64,
        backing: Option<&str>,
        fill: &[(u64, u64, u8)],
    ) -> String {
        let path = path_str(&dir.as_path().join(name));
        let backing = backing.map(|b| BackingFile {
            filename: b.to_owned(),
            format: None,
        });
        let cow = crate::cow::CowDriver;
        cow.create(&path, sectors * SECTOR_SIZE, backing.as_ref()).unwrap();

        let mut image = cow.open(&path, OpenFlags::RDWR).unwrap();
        for (start, end, byte) in fill {
            let data = vec![*byte; ((end - start) * SECTOR_SIZE) as usize];
            image.write(*start, &data).unwrap();
        }
        path
    }

    pub(crate) fn layer_with_clock() -> (BlockLayer, Rc<VirtualClock>) {
        let clock = Rc::new(VirtualClock::new());
        let layer = BlockLayer::with_clock(DriverRegistry::with_builtin(), clock.clone()).unwrap();
        (layer, clock)
    }

    fn sector_bytes(layer: &mut BlockLayer, id: HandleId, sector: u64) -> u8 {
        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        layer.read(id, sector, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == buf[0]));
        buf[0]
    }

    #[test]
    fn test_open_raw_and_io() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 16, &[]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer.open("disk0", &path, OpenFlags::RDWR, None).unwrap();
        assert_eq!(layer.format_name(id), "raw");
        assert_eq!(layer.total_sectors(id), 16);
        assert_eq!(layer.getlength(id).unwrap(), 16 * SECTOR_SIZE);
        assert_eq!(layer.find("disk0"), Some(id));
        assert_eq!(layer.devices(), vec![id]);
        assert!(layer.has_zero_init(id));
        assert!(!layer.is_encrypted(id));

        layer.write(id, 3, &[0x42; 1024]).unwrap();
        assert_eq!(sector_bytes(&mut layer, id, 3), 0x42);
        assert_eq!(sector_bytes(&mut layer, id, 4), 0x42);
        assert_eq!(sector_bytes(&mut layer, id, 5), 0);
        layer.flush(id).unwrap();

        let err = layer.write(id, 15, &[0; 1024]).unwrap_err();
        assert!(matches!(
            err,
            Error::BoundsViolation {
                sector: 15,
                nb_sectors: 2,
                total_sectors: 16
            }
        ));
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            layer.read(id, u64::MAX, &mut buf),
            Err(Error::BoundsViolation { .. })
        ));
        assert!(matches!(
            layer.read(id, 0, &mut buf[..100]),
            Err(Error::InvalidArgument(_))
        ));

        let stats = layer.stats(id);
        assert_eq!(stats.nr_ops(BlockAcctType::Write), 1);
        assert_eq!(stats.nr_bytes(BlockAcctType::Write), 1024);
        assert_eq!(stats.nr_ops(BlockAcctType::Read), 3);
        assert_eq!(stats.nr_ops(BlockAcctType::Flush), 1);
        assert_eq!(stats.wr_highest_sector, 4);

        assert!(matches!(
            layer.open("disk0", &path, OpenFlags::empty(), None),
            Err(Error::InvalidArgument(_))
        ));

        layer.close(id);
        assert!(!layer.is_open(id));
        assert!(layer.find("disk0").is_none());

        // The slot is reused, the stale id stays invalid.
        let id2 = layer.open("disk0", &path, OpenFlags::empty(), None).unwrap();
        assert_ne!(id, id2);
        assert!(!layer.is_open(id));
    }

    #[test]
    #[should_panic(expected = "use of closed block handle")]
    fn test_stale_handle_panics() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 1, &[]);
        let (mut layer, _clock) = layer_with_clock();
        let id = layer.open("", &path, OpenFlags::empty(), None).unwrap();
        layer.close(id);
        layer.total_sectors(id);
    }

    #[test]
    fn test_stale_remove_keeps_reused_slot() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 1, &[]);
        let (mut layer, _clock) = layer_with_clock();
        let id = layer.open("", &path, OpenFlags::empty(), None).unwrap();
        layer.close(id);
        let id2 = layer.open("", &path, OpenFlags::empty(), None).unwrap();
        assert_eq!(id.index, id2.index);

        let removed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            layer.remove(id);
        }));
        assert!(removed.is_err());
        assert!(layer.is_open(id2));
        assert_eq!(layer.total_sectors(id2), 1);
        layer.close(id2);
    }

    #[test]
    fn test_read_only_handle() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 4, &[(0, 4, 9)]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer.open("", &path, OpenFlags::empty(), None).unwrap();
        assert!(layer.is_read_only(id));
        assert!(matches!(layer.write(id, 0, &[0; 512]), Err(Error::ReadOnly)));
        assert!(matches!(layer.pwrite(id, 7, &[0; 3]), Err(Error::ReadOnly)));
        assert!(matches!(layer.truncate(id, 0), Err(Error::ReadOnly)));
        assert_eq!(sector_bytes(&mut layer, id, 0), 9);
    }

    #[test]
    fn test_pread_pwrite_unaligned() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 8, &[(0, 8, 0x11)]);
        let (mut layer, _clock) = layer_with_clock();
        let id = layer.open("", &path, OpenFlags::RDWR, None).unwrap();

        let data: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
        layer.pwrite(id, 300, &data).unwrap();

        let mut buf = vec![0u8; 700];
        layer.pread(id, 300, &mut buf).unwrap();
        assert_eq!(buf, data);

        let mut around = vec![0u8; 1024];
        layer.pread(id, 0, &mut around).unwrap();
        assert!(around[..300].iter().all(|b| *b == 0x11));
        assert_eq!(&around[300..1000], &data[..]);
        assert!(around[1000..].iter().all(|b| *b == 0x11));

        let mut tail = vec![0u8; 10];
        assert!(matches!(
            layer.pread(id, 8 * SECTOR_SIZE - 5, &mut tail),
            Err(Error::BoundsViolation { .. })
        ));
        layer.pread(id, 8 * SECTOR_SIZE - 10, &mut tail).unwrap();
    }

    #[test]
    fn test_open_file_is_growable() {
        let dir = TempDir::new().unwrap();
        let path = path_str(&dir.as_path().join("grow.img"));
        let (mut layer, _clock) = layer_with_clock();

        let id = layer
            .open_file(&path, OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        assert_eq!(layer.total_sectors(id), 0);
        layer.write(id, 9, &[1; 512]).unwrap();
        assert_eq!(layer.total_sectors(id), 10);
        assert_eq!(layer.getlength(id).unwrap(), 10 * SECTOR_SIZE);
        layer.truncate(id, 2 * SECTOR_SIZE).unwrap();
        assert_eq!(layer.total_sectors(id), 2);
    }

    #[test]
    fn test_create_requires_capable_driver() {
        let dir = TempDir::new().unwrap();
        let (mut layer, _clock) = layer_with_clock();

        assert!(matches!(
            layer.open(
                "",
                "nbd:127.0.0.1:1",
                OpenFlags::RDWR | OpenFlags::CREAT,
                None
            ),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            layer.create("nbd", "nbd:127.0.0.1:1", 4096, None),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            layer.create("qcow2", "x", 4096, None),
            Err(Error::NotFound(_))
        ));

        let path = path_str(&dir.as_path().join("new.img"));
        layer.create("raw", &path, 4096, None).unwrap();
        let id = layer.open("", &path, OpenFlags::empty(), None).unwrap();
        assert_eq!(layer.total_sectors(id), 8);
    }

    #[test]
    fn test_explicit_driver_overrides_probe() {
        let dir = TempDir::new().unwrap();
        let path = cow_image(&dir, "top.cow", 8, None, &[]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer.open("", &path, OpenFlags::empty(), None).unwrap();
        assert_eq!(layer.format_name(id), "cow");
        assert_eq!(layer.total_sectors(id), 8);

        let id = layer.open("", &path, OpenFlags::empty(), Some("raw")).unwrap();
        assert_eq!(layer.format_name(id), "raw");

        let id = layer.open("", &path, OpenFlags::NO_PROBE, None).unwrap();
        assert_eq!(layer.format_name(id), "raw");

        assert!(matches!(
            layer.open("", &path, OpenFlags::empty(), Some("vmdk")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_sim_prefix_overrides_probe() {
        let dir = TempDir::new().unwrap();
        let path = cow_image(&dir, "top.cow", 8, None, &[]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer
            .open("", &format!("blksim:{path}"), OpenFlags::empty(), None)
            .unwrap();
        assert_eq!(layer.format_name(id), "blksim");
    }

    #[test]
    fn test_backing_chain() {
        let dir = TempDir::new().unwrap();
        raw_image(&dir, "base.img", 32, &[(0, 8, 0xba)]);
        cow_image(&dir, "mid.cow", 32, Some("base.img"), &[(8, 16, 0x11)]);
        let top = cow_image(&dir, "top.cow", 32, Some("mid.cow"), &[(4, 6, 0x70)]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer.open("top", &top, OpenFlags::RDWR, None).unwrap();
        let mid = layer.backing_hd(id).unwrap();
        let base = layer.backing_hd(mid).unwrap();
        assert_eq!(layer.backing_hd(base), None);
        assert_eq!(layer.backing_filename(id), Some("mid.cow"));
        assert_eq!(layer.format_name(base), "raw");
        assert!(layer.is_read_only(mid));
        assert!(layer.is_read_only(base));
        assert_eq!(
            layer.filename(base),
            path_str(&dir.as_path().join("base.img"))
        );

        assert_eq!(sector_bytes(&mut layer, id, 0), 0xba);
        assert_eq!(sector_bytes(&mut layer, id, 4), 0x70);
        assert_eq!(sector_bytes(&mut layer, id, 7), 0xba);
        assert_eq!(sector_bytes(&mut layer, id, 9), 0x11);
        assert_eq!(sector_bytes(&mut layer, id, 20), 0);

        assert_eq!(layer.is_allocated(id, 0, 32).unwrap(), (false, 4));
        assert_eq!(layer.is_allocated(id, 4, 32).unwrap(), (true, 2));
        assert_eq!(layer.is_allocated(id, 32, 1).unwrap(), (false, 0));
        assert_eq!(
            layer.is_allocated_above(Some(mid), Some(base), 0, 32).unwrap(),
            (false, 8)
        );
        assert_eq!(
            layer.is_allocated_above(Some(mid), Some(base), 8, 32).unwrap(),
            (true, 8)
        );
        assert_eq!(
            layer.is_allocated_above(Some(mid), None, 0, 32).unwrap(),
            (true, 8)
        );

        // Writes land in the top image only.
        layer.write(id, 0, &[0xee; 512]).unwrap();
        assert_eq!(sector_bytes(&mut layer, id, 0), 0xee);
        assert_eq!(sector_bytes(&mut layer, base, 0), 0xba);

        layer.close(id);
        assert!(!layer.is_open(mid));
        assert!(!layer.is_open(base));

        let id = layer
            .open("", &top, OpenFlags::NO_BACKING, None)
            .unwrap();
        assert_eq!(layer.backing_hd(id), None);
        assert_eq!(sector_bytes(&mut layer, id, 9), 0);
    }

    #[test]
    fn test_backing_chain_loop_rejected() {
        let dir = TempDir::new().unwrap();
        cow_image(&dir, "a.cow", 8, Some("b.cow"), &[]);
        let b = cow_image(&dir, "b.cow", 8, Some("a.cow"), &[]);
        let (mut layer, _clock) = layer_with_clock();

        assert!(matches!(
            layer.open("", &b, OpenFlags::empty(), None),
            Err(Error::InvalidArgument(_))
        ));
        // Nothing stays open after the failure.
        assert_eq!(layer.handles().count(), 0);

        let missing = cow_image(&dir, "orphan.cow", 8, Some("missing.img"), &[]);
        assert!(layer.open("", &missing, OpenFlags::empty(), None).is_err());
        assert_eq!(layer.handles().count(), 0);
    }

    #[test]
    fn test_backing_chain_depth_limit() {
        let dir = TempDir::new().unwrap();
        raw_image(&dir, "l0.img", 1, &[]);
        let mut top = String::new();
        for i in 1..=MAX_BACKING_DEPTH {
            let backing = if i == 1 {
                "l0.img".to_owned()
            } else {
                format!("l{}.cow", i - 1)
            };
            top = cow_image(&dir, &format!("l{i}.cow"), 1, Some(backing.as_str()), &[]);
        }
        let (mut layer, _clock) = layer_with_clock();
        assert!(matches!(
            layer.open("", &top, OpenFlags::empty(), None),
            Err(Error::InvalidArgument(_))
        ));

        let ok = path_str(&dir.as_path().join(format!("l{}.cow", MAX_BACKING_DEPTH - 1)));
        let id = layer.open("", &ok, OpenFlags::empty(), None).unwrap();
        layer.close(id);
    }

    #[test]
    fn test_copy_on_read() {
        let dir = TempDir::new().unwrap();
        raw_image(&dir, "base.img", 16, &[(0, 16, 0x3c)]);
        let top = cow_image(&dir, "top.cow", 16, Some("base.img"), &[]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer.open("", &top, OpenFlags::RDWR, None).unwrap();
        let mut buf = vec![0u8; 2 * SECTOR_SIZE as usize];
        layer.read(id, 0, &mut buf).unwrap();
        assert_eq!(layer.is_allocated(id, 0, 16).unwrap(), (false, 16));

        layer.enable_copy_on_read(id);
        layer.enable_copy_on_read(id);
        layer.disable_copy_on_read(id);
        assert!(layer.is_copy_on_read(id));
        layer.read(id, 2, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0x3c));
        assert_eq!(layer.is_allocated(id, 0, 16).unwrap(), (false, 2));
        assert_eq!(layer.is_allocated(id, 2, 16).unwrap(), (true, 2));
        layer.disable_copy_on_read(id);
        assert!(!layer.is_copy_on_read(id));
        layer.close(id);

        let id = layer
            .open("", &top, OpenFlags::RDWR | OpenFlags::COPY_ON_READ, None)
            .unwrap();
        assert!(layer.is_copy_on_read(id));
        assert!(!layer.is_copy_on_read(layer.backing_hd(id).unwrap()));
    }

    #[test]
    fn test_snapshot_discards_writes() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 8, &[(0, 8, 0x55)]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer
            .open("snap", &path, OpenFlags::SNAPSHOT, None)
            .unwrap();
        assert!(!layer.is_read_only(id));
        assert_eq!(layer.format_name(id), "cow");
        assert_eq!(layer.total_sectors(id), 8);
        let overlay = layer.filename(id).to_owned();
        let base = layer.backing_hd(id).unwrap();
        assert_eq!(layer.format_name(base), "raw");

        layer.write(id, 1, &[0xaa; 512]).unwrap();
        assert_eq!(sector_bytes(&mut layer, id, 0), 0x55);
        assert_eq!(sector_bytes(&mut layer, id, 1), 0xaa);
        layer.close(id);

        assert!(!Path::new(&overlay).exists());
        let data = fs::read(&path).unwrap();
        assert!(data.iter().all(|b| *b == 0x55));
    }

    #[test]
    fn test_nocache_images() {
        let dir = TempDir::new().unwrap();
        // Three sectors, so the file ends inside a direct I/O block.
        let raw = raw_image(&dir, "base.img", 3, &[(0, 3, 0x21)]);
        let top = cow_image(&dir, "top.cow", 3, Some("base.img"), &[(1, 2, 0x43)]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer
            .open("", &raw, OpenFlags::RDWR | OpenFlags::NOCACHE, None)
            .unwrap();
        assert_eq!(layer.total_sectors(id), 3);
        layer.pwrite(id, 700, &[0x99; 100]).unwrap();
        let mut buf = vec![0u8; 1536];
        layer.pread(id, 0, &mut buf).unwrap();
        assert!(buf[..700].iter().all(|b| *b == 0x21));
        assert!(buf[700..800].iter().all(|b| *b == 0x99));
        assert!(buf[800..].iter().all(|b| *b == 0x21));
        layer.close(id);
        assert_eq!(fs::metadata(&raw).unwrap().len(), 3 * SECTOR_SIZE);

        let id = layer
            .open("", &top, OpenFlags::RDWR | OpenFlags::NOCACHE, None)
            .unwrap();
        assert_eq!(layer.format_name(id), "cow");
        assert_eq!(sector_bytes(&mut layer, id, 1), 0x43);
        layer.write(id, 2, &[0x65; 512]).unwrap();
        assert_eq!(layer.is_allocated(id, 2, 1).unwrap(), (true, 1));
        layer.close(id);

        let id = layer.open("", &top, OpenFlags::empty(), None).unwrap();
        assert_eq!(sector_bytes(&mut layer, id, 1), 0x43);
        assert_eq!(sector_bytes(&mut layer, id, 2), 0x65);
        layer.close(id);

        let id = layer
            .open(
                "",
                &raw,
                OpenFlags::RDWR | OpenFlags::SNAPSHOT | OpenFlags::NOCACHE,
                None,
            )
            .unwrap();
        layer.write(id, 0, &[0x77; 512]).unwrap();
        assert_eq!(sector_bytes(&mut layer, id, 0), 0x77);
        assert_eq!(sector_bytes(&mut layer, id, 2), 0x21);
        layer.close(id);
        assert!(fs::read(&raw).unwrap()[..512].iter().all(|b| *b == 0x21));
    }

    #[test]
    fn test_snapshot_keeps_explicit_format() {
        let dir = TempDir::new().unwrap();
        let path = cow_image(&dir, "disk.cow", 4, None, &[]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer
            .open("", &path, OpenFlags::SNAPSHOT, Some("raw"))
            .unwrap();
        let base = layer.backing_hd(id).unwrap();
        assert_eq!(layer.format_name(base), "raw");
        assert_eq!(
            layer.total_sectors(id),
            fs::metadata(&path).unwrap().len() / SECTOR_SIZE
        );
    }

    #[test]
    fn test_geometry() {
        let temp = TempFile::new().unwrap();
        temp.as_file().set_len(64 * 1024 * 1024).unwrap();
        let path = path_str(temp.as_path());
        let (mut layer, _clock) = layer_with_clock();
        let id = layer.open("", &path, OpenFlags::empty(), None).unwrap();

        assert_eq!(layer.geometry_hint(id), None);
        let geometry = layer.guess_geometry(id);
        assert_eq!(
            geometry,
            Geometry {
                cylinders: 130,
                heads: 16,
                sectors: 63
            }
        );
        assert_eq!(layer.geometry_hint(id), Some(geometry));

        let hint = Geometry {
            cylinders: 10,
            heads: 4,
            sectors: 32,
        };
        layer.set_geometry_hint(id, hint);
        assert_eq!(layer.guess_geometry(id), hint);

        let small = TempFile::new().unwrap();
        small.as_file().set_len(4096).unwrap();
        let id = layer
            .open("", &path_str(small.as_path()), OpenFlags::empty(), None)
            .unwrap();
        assert_eq!(layer.guess_geometry(id).cylinders, 2);
    }

    #[test]
    fn test_eject_and_lock() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "cd.iso", 4, &[]);
        let (mut layer, _clock) = layer_with_clock();
        let id = layer.open("cd0", &path, OpenFlags::empty(), None).unwrap();

        assert!(layer.is_inserted(id));
        layer.set_locked(id, true);
        assert!(layer.is_locked(id));
        assert!(matches!(layer.eject(id, true), Err(Error::Busy)));

        layer.set_locked(id, false);
        layer.eject(id, true).unwrap();
        assert!(!layer.is_inserted(id));
        let mut buf = vec![0u8; 512];
        assert!(matches!(layer.read(id, 0, &mut buf), Err(Error::NoMedium)));

        layer.eject(id, false).unwrap();
        layer.read(id, 0, &mut buf).unwrap();
    }

    #[test]
    fn test_error_policy() {
        let dir = TempDir::new().unwrap();
        let path = raw_image(&dir, "disk.img", 4, &[]);
        let (mut layer, _clock) = layer_with_clock();
        let id = layer.open("", &path, OpenFlags::RDWR, None).unwrap();

        assert_eq!(
            layer.error_action(id, false, -libc::EIO),
            BlockErrorAction::Report
        );
        layer.set_on_error(id, BlockdevOnError::Ignore, BlockdevOnError::Enospc);
        assert_eq!(
            layer.error_action(id, true, -libc::EIO),
            BlockErrorAction::Ignore
        );
        assert_eq!(
            layer.error_action(id, false, -libc::EIO),
            BlockErrorAction::Report
        );
        assert_eq!(layer.iostatus(id), IoStatus::Ok);
        assert_eq!(
            layer.error_action(id, false, -libc::ENOSPC),
            BlockErrorAction::Stop
        );
        assert_eq!(layer.iostatus(id), IoStatus::NoSpace);
        layer.iostatus_reset(id);
        assert_eq!(layer.iostatus(id), IoStatus::Ok);
    }

    #[test]
    fn test_change_backing_file() {
        let dir = TempDir::new().unwrap();
        raw_image(&dir, "base.img", 8, &[(0, 8, 1)]);
        raw_image(&dir, "other.img", 8, &[(0, 8, 2)]);
        let top = cow_image(&dir, "top.cow", 8, Some("base.img"), &[]);
        let (mut layer, _clock) = layer_with_clock();

        let id = layer.open("", &top, OpenFlags::RDWR, None).unwrap();
        let other = BackingFile {
            filename: "other.img".to_owned(),
            format: None,
        };
        layer.change_backing_file(id, Some(&other)).unwrap();
        assert_eq!(layer.backing_filename(id), Some("other.img"));
        // The open chain is untouched until reopened.
        assert_eq!(sector_bytes(&mut layer, id, 0), 1);
        layer.close(id);

        let id = layer.open("", &top, OpenFlags::empty(), None).unwrap();
        assert_eq!(sector_bytes(&mut layer, id, 0), 2);
        assert!(matches!(
            layer.change_backing_file(id, None),
            Err(Error::ReadOnly)
        ));
    }
}
