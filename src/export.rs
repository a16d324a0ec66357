// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;

use block::{BlockLayer, HandleId};
use log::{debug, info};
use nbd::NbdExport;

/// Window of a block handle served over NBD.
pub struct BlockExport {
    layer: BlockLayer,
    handle: HandleId,
    offset: u64,
    size: u64,
}

fn io_error(e: block::Error) -> io::Error {
    debug!("Export I/O failed: {e}");
    io::Error::from_raw_os_error(-e.errno())
}

impl BlockExport {
    /// Exports `size` bytes of the image starting at byte `offset`. The
    /// export owns the layer and closes the handle when dropped.
    pub fn new(layer: BlockLayer, handle: HandleId, offset: u64, size: u64) -> Self {
        BlockExport {
            layer,
            handle,
            offset,
            size,
        }
    }
}

impl NbdExport for BlockExport {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.layer
            .pread(self.handle, self.offset + offset, buf)
            .map_err(io_error)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.layer
            .pwrite(self.handle, self.offset + offset, data)
            .map_err(io_error)
    }
}

impl Drop for BlockExport {
    fn drop(&mut self) {
        if self.layer.is_open(self.handle) {
            info!("Closing {}", self.layer.filename(self.handle));
            self.layer.close(self.handle);
        }
    }
}
