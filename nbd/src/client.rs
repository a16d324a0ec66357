// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use log::{debug, warn};

use crate::protocol::{
    read_exact_or, Handshake, NbdCommand, NbdError, NbdReply, NbdRequest, Result, NBD_BLOCK_SIZE,
};

/// Location of an NBD server, parsed from `nbd:host:port` or
/// `nbd:unix:path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NbdAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl NbdAddr {
    pub const PREFIX: &'static str = "nbd:";

    pub fn parse(filename: &str) -> Result<Self> {
        let invalid = || NbdError::InvalidAddress(filename.to_owned());

        let rest = filename.strip_prefix(Self::PREFIX).ok_or_else(invalid)?;
        if let Some(path) = rest.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(NbdAddr::Unix(PathBuf::from(path)));
        }

        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(NbdAddr::Tcp {
            host: host.to_owned(),
            port,
        })
    }

    pub fn connect(&self) -> Result<NbdStream> {
        match self {
            NbdAddr::Tcp { host, port } => {
                let stream =
                    TcpStream::connect((host.as_str(), *port)).map_err(NbdError::Connect)?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Could not disable Nagle on NBD connection: {e}");
                }
                Ok(NbdStream::Tcp(stream))
            }
            NbdAddr::Unix(path) => Ok(NbdStream::Unix(
                UnixStream::connect(path).map_err(NbdError::Connect)?,
            )),
        }
    }
}

/// Transport used by an NBD connection.
#[derive(Debug)]
pub enum NbdStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for NbdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NbdStream::Tcp(s) => s.read(buf),
            NbdStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for NbdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NbdStream::Tcp(s) => s.write(buf),
            NbdStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NbdStream::Tcp(s) => s.flush(),
            NbdStream::Unix(s) => s.flush(),
        }
    }
}

/// Client side of an NBD connection.
///
/// Requests are issued one at a time, each waiting for its reply before
/// the next one is sent.
pub struct NbdClient<S> {
    stream: S,
    size: u64,
    blocksize: u32,
    next_handle: u64,
}

impl NbdClient<NbdStream> {
    pub fn connect(addr: &NbdAddr) -> Result<Self> {
        Self::negotiate(addr.connect()?)
    }
}

impl<S: Read + Write> NbdClient<S> {
    /// Reads and validates the server handshake.
    pub fn negotiate(mut stream: S) -> Result<Self> {
        let mut buf = [0u8; Handshake::SIZE_BYTES];
        read_exact_or(&mut stream, &mut buf, "handshake")?;
        let handshake = Handshake::from_bytes(&buf)?;

        debug!("NBD export size {} bytes", handshake.size);

        Ok(NbdClient {
            stream,
            size: handshake.size,
            blocksize: NBD_BLOCK_SIZE,
            next_handle: 0,
        })
    }

    /// Export size in bytes, as announced by the server.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    fn send_request(&mut self, command: NbdCommand, offset: u64, length: u32) -> Result<u64> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);

        let request = NbdRequest {
            command,
            handle,
            offset,
            length,
        };
        self.stream
            .write_all(&request.to_bytes())
            .map_err(NbdError::Io)?;

        Ok(handle)
    }

    fn receive_reply(&mut self, handle: u64) -> Result<()> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        read_exact_or(&mut self.stream, &mut buf, "reply")?;
        let reply = NbdReply::from_bytes(&buf)?;

        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }

        if reply.error != 0 {
            return Err(NbdError::Remote(reply.error));
        }

        Ok(())
    }

    fn check_length(len: usize) -> Result<u32> {
        u32::try_from(len).map_err(|_| NbdError::RequestTooLarge(u32::MAX))
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let length = Self::check_length(buf.len())?;
        let handle = self.send_request(NbdCommand::Read, offset, length)?;
        self.receive_reply(handle)?;
        read_exact_or(&mut self.stream, buf, "read payload")
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let length = Self::check_length(data.len())?;
        let handle = self.send_request(NbdCommand::Write, offset, length)?;
        self.stream.write_all(data).map_err(NbdError::Io)?;
        self.receive_reply(handle)
    }

    /// Tells the server to end the session. No reply is expected.
    pub fn disconnect(&mut self) -> Result<()> {
        self.send_request(NbdCommand::Disconnect, 0, 0)?;
        self.stream.flush().map_err(NbdError::Io)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
