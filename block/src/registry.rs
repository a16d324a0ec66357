// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::rc::Rc;

use log::debug;

use crate::blksim::{SimConfig, SimDriver};
use crate::cow::CowDriver;
use crate::driver::BlockDriver;
use crate::nbd_client::NbdDriver;
use crate::protocol_prefix;
use crate::raw::RawDriver;

/// Table of the drivers the block layer may open images with.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Rc<dyn BlockDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every driver shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Rc::new(RawDriver));
        registry.register(Rc::new(CowDriver));
        registry.register(Rc::new(SimDriver::new(SimConfig::default())));
        registry.register(Rc::new(NbdDriver));
        registry
    }

    pub fn register(&mut self, driver: Rc<dyn BlockDriver>) {
        debug!("Registering block driver {}", driver.format_name());
        self.drivers.push(driver);
    }

    /// First driver whose format or protocol name is `name`.
    pub fn find(&self, name: &str) -> Option<Rc<dyn BlockDriver>> {
        self.drivers
            .iter()
            .find(|d| d.format_name() == name || d.protocol_name() == Some(name))
            .cloned()
    }

    /// Protocol driver named by the `scheme:` prefix of `filename`.
    pub fn find_protocol(&self, filename: &str) -> Option<Rc<dyn BlockDriver>> {
        let scheme = protocol_prefix(filename)?;
        self.drivers
            .iter()
            .find(|d| d.protocol_name() == Some(scheme))
            .cloned()
    }

    /// Driver scoring highest on the image header in `buf`. On a tie the
    /// earliest registered driver wins.
    pub fn probe(&self, buf: &[u8], filename: &str) -> Option<Rc<dyn BlockDriver>> {
        let mut best: Option<(u32, &Rc<dyn BlockDriver>)> = None;
        for driver in self.drivers.iter() {
            let score = driver.probe(buf, filename);
            if score > 0 && best.is_none_or(|(s, _)| score > s) {
                best = Some((score, driver));
            }
        }
        best.map(|(_, d)| d.clone())
    }

    pub fn format_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.format_name()).collect()
    }
}
