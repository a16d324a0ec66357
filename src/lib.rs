// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Network Block Device server exporting one disk image to one client.

pub mod config;
pub mod export;
pub mod partition;

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use block::{BlockLayer, DriverRegistry};
use log::{info, warn};
use nbd::{NbdError, NbdServer, NbdStream};
use thiserror::Error;

pub use config::{cli, ConfigError, ServerConfig};
pub use export::BlockExport;
pub use partition::{find_partition, PartitionError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to set up the block layer")]
    BlockLayer(#[source] block::Error),
    #[error("Failed to open {0}")]
    Open(String, #[source] block::Error),
    #[error("Failed to find the partition to export")]
    Partition(#[source] PartitionError),
    #[error("Offset {offset} is past the end of the {size} bytes image")]
    OffsetPastEnd { offset: u64, size: u64 },
    #[error("Failed to listen on {0}")]
    Bind(String, #[source] io::Error),
    #[error("Failed to accept a connection")]
    Accept(#[source] io::Error),
    #[error("NBD session failed")]
    Session(#[source] NbdError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Socket the server accepts its client on.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        if let Some(path) = &config.socket {
            let listener = UnixListener::bind(path)
                .map_err(|e| Error::Bind(path.display().to_string(), e))?;
            info!("Listening on {}", path.display());
            return Ok(Listener::Unix(listener, path.clone()));
        }

        let addr = format!("{}:{}", config.bind, config.port);
        let listener = TcpListener::bind(&addr).map_err(|e| Error::Bind(addr, e))?;
        Ok(Listener::Tcp(listener))
    }

    /// Address of a TCP listener, useful when bound to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }

    pub fn accept(&self) -> io::Result<NbdStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                info!("Accepted connection from {peer}");
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Could not disable Nagle on the connection: {e}");
                }
                Ok(NbdStream::Tcp(stream))
            }
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept()?;
                info!("Accepted connection on {}", path.display());
                Ok(NbdStream::Unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            if let Err(e) = fs::remove_file(path.as_path()) {
                warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }
}

/// Opens the image named by `config` and wraps the exported window of it.
pub fn open_export(config: &ServerConfig) -> Result<BlockExport> {
    let mut layer = BlockLayer::new(DriverRegistry::with_builtin()).map_err(Error::BlockLayer)?;
    let id = layer
        .open(
            "",
            &config.file,
            config.open_flags(),
            config.format.as_deref(),
        )
        .map_err(|e| Error::Open(config.file.clone(), e))?;
    let image_size = layer
        .getlength(id)
        .map_err(|e| Error::Open(config.file.clone(), e))?;

    let (offset, size) = match config.partition {
        Some(partition) => {
            find_partition(&mut layer, id, partition).map_err(Error::Partition)?
        }
        None => {
            if config.offset > image_size {
                return Err(Error::OffsetPastEnd {
                    offset: config.offset,
                    size: image_size,
                });
            }
            (config.offset, image_size - config.offset)
        }
    };

    info!(
        "Exporting {} bytes of {} at offset {offset}",
        size, config.file
    );
    Ok(BlockExport::new(layer, id, offset, size))
}

/// Serves the image to the first client accepted on `listener`, until it
/// disconnects.
pub fn run_server(config: &ServerConfig, listener: Listener) -> Result<()> {
    let export = open_export(config)?;
    let mut server = NbdServer::new(export, config.read_only);

    let mut stream = listener.accept().map_err(Error::Accept)?;
    server.serve(&mut stream).map_err(Error::Session)?;
    Ok(())
}
