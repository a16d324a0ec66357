// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use log::{debug, info};
use nbd::{NbdAddr, NbdClient, NbdStream};

use crate::driver::{BlockDriver, DriverState};
use crate::{Error, OpenFlags, Result, SECTOR_SIZE};

/// Remote image served over NBD, opened as `nbd:host:port` or
/// `nbd:unix:path`.
pub struct NbdDriver;

impl BlockDriver for NbdDriver {
    fn format_name(&self) -> &'static str {
        "nbd"
    }

    fn protocol_name(&self) -> Option<&'static str> {
        Some("nbd")
    }

    fn open(&self, filename: &str, _flags: OpenFlags) -> Result<Box<dyn DriverState>> {
        let addr = NbdAddr::parse(filename)?;
        let client = NbdClient::connect(&addr)?;
        info!(
            "Connected to NBD export {filename} of {} bytes",
            client.size()
        );
        Ok(Box::new(NbdDisk {
            client: Some(client),
        }))
    }
}

pub struct NbdDisk {
    client: Option<NbdClient<NbdStream>>,
}

impl NbdDisk {
    fn client(&mut self) -> Result<&mut NbdClient<NbdStream>> {
        self.client
            .as_mut()
            .ok_or(Error::InvalidOperation("NBD connection closed".to_owned()))
    }
}

impl DriverState for NbdDisk {
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.client()?
            .read(sector * SECTOR_SIZE, buf)
            .map_err(Error::from)
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        self.client()?
            .write(sector * SECTOR_SIZE, buf)
            .map_err(Error::from)
    }

    fn length(&mut self) -> Result<u64> {
        Ok(self.client()?.size())
    }

    fn has_zero_init(&self) -> bool {
        false
    }

    fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.disconnect() {
                debug!("Failed to send NBD disconnect: {e}");
            }
        }
    }
}

impl Drop for NbdDisk {
    fn drop(&mut self) {
        self.close();
    }
}
