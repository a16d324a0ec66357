// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::path::PathBuf;

use block::OpenFlags;
use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1024;
pub const DEFAULT_BIND: &str = "0.0.0.0";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid offset: {0}")]
    InvalidOffset(String),
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),
    #[error("Missing image file")]
    MissingFile,
}

/// Settings of one server invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub file: String,
    pub port: u16,
    pub bind: String,
    /// Listen on this Unix socket instead of TCP.
    pub socket: Option<PathBuf>,
    /// Byte offset of the export within the image.
    pub offset: u64,
    pub read_only: bool,
    /// MBR partition to export, 1 to 8.
    pub partition: Option<u32>,
    pub snapshot: bool,
    pub nocache: bool,
    pub format: Option<String>,
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            file: String::new(),
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_owned(),
            socket: None,
            offset: 0,
            read_only: false,
            partition: None,
            snapshot: false,
            nocache: false,
            format: None,
            verbose: false,
        }
    }
}

pub fn cli() -> Command {
    Command::new("nbd-server")
        .version(env!("BUILT_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Export a disk image over the Network Block Device protocol.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .help("Interface to bind to")
                .num_args(1)
                .default_value(DEFAULT_BIND),
        )
        .arg(
            Arg::new("file")
                .help("Disk image to export")
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .help("Image format, probed when not given")
                .num_args(1),
        )
        .arg(
            Arg::new("nocache")
                .short('n')
                .long("nocache")
                .help("Bypass the host page cache")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .help("Offset in bytes into the image")
                .num_args(1)
                .default_value("0"),
        )
        .arg(
            Arg::new("partition")
                .short('P')
                .long("partition")
                .help("Only expose MBR partition NUM (1 to 8)")
                .num_args(1),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("TCP port to listen on")
                .num_args(1)
                .default_value("1024"),
        )
        .arg(
            Arg::new("read-only")
                .short('r')
                .long("read-only")
                .help("Export read-only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("snapshot")
                .short('s')
                .long("snapshot")
                .help("Discard writes in a temporary overlay")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("socket")
                .short('k')
                .long("socket")
                .help("Unix socket to listen on instead of TCP")
                .num_args(1),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Display extra debugging information")
                .action(ArgAction::SetTrue),
        )
}

impl ServerConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ConfigError> {
        let file = matches
            .get_one::<String>("file")
            .ok_or(ConfigError::MissingFile)?
            .clone();

        let port = matches
            .get_one::<String>("port")
            .map(|p| p.parse::<u16>().map_err(|_| ConfigError::InvalidPort(p.clone())))
            .transpose()?
            .unwrap_or(DEFAULT_PORT);

        let offset = matches
            .get_one::<String>("offset")
            .map(|o| parse_size(o).ok_or_else(|| ConfigError::InvalidOffset(o.clone())))
            .transpose()?
            .unwrap_or(0);

        let partition = matches
            .get_one::<String>("partition")
            .map(|p| match p.parse::<u32>() {
                Ok(n) if (1..=8).contains(&n) => Ok(n),
                _ => Err(ConfigError::InvalidPartition(p.clone())),
            })
            .transpose()?;

        Ok(ServerConfig {
            file,
            port,
            bind: matches
                .get_one::<String>("bind")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BIND.to_owned()),
            socket: matches.get_one::<String>("socket").map(PathBuf::from),
            offset,
            read_only: matches.get_flag("read-only"),
            partition,
            snapshot: matches.get_flag("snapshot"),
            nocache: matches.get_flag("nocache"),
            format: matches.get_one::<String>("format").cloned(),
            verbose: matches.get_flag("verbose"),
        })
    }

    pub fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::empty();
        if !self.read_only {
            flags |= OpenFlags::RDWR;
        }
        if self.snapshot {
            flags |= OpenFlags::SNAPSHOT;
        }
        if self.nocache {
            flags |= OpenFlags::NOCACHE;
        }
        flags
    }
}

// Decimal, or hexadecimal with a 0x prefix.
fn parse_size(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
