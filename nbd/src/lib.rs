// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Network Block Device protocol: wire codec, client and single-client
//! server.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{NbdAddr, NbdClient, NbdStream};
pub use protocol::{NbdError, Result};
pub use server::{NbdExport, NbdServer, Trip};
