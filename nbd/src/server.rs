// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io::{self, ErrorKind, Read, Write};

use log::{debug, info, warn};

use crate::protocol::{
    read_exact_or, Handshake, NbdCommand, NbdError, NbdReply, NbdRequest, Result,
    NBD_MAX_BUFFER_SIZE,
};

/// Storage served over an NBD connection, addressed in bytes from the
/// start of the export.
pub trait NbdExport {
    fn size(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

impl<E: NbdExport + ?Sized> NbdExport for Box<E> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }
}

/// Outcome of one request/reply round trip.
#[derive(Debug)]
pub enum Trip {
    /// The request was honored.
    Served,
    /// The request was refused with an error reply. The connection stays
    /// usable.
    Rejected(NbdError),
    /// The client sent a DISCONNECT request.
    Disconnect,
    /// The client closed the connection between two requests.
    Hangup,
}

/// Server side of an NBD connection, serving one client at a time.
pub struct NbdServer<E> {
    export: E,
    readonly: bool,
    buffer: Vec<u8>,
}

impl<E: NbdExport> NbdServer<E> {
    pub fn new(export: E, readonly: bool) -> Self {
        NbdServer {
            export,
            readonly,
            buffer: Vec::new(),
        }
    }

    pub fn export(&self) -> &E {
        &self.export
    }

    pub fn into_export(self) -> E {
        self.export
    }

    pub fn negotiate<S: Write>(&self, stream: &mut S) -> Result<()> {
        let handshake = Handshake {
            size: self.export.size(),
        };
        stream
            .write_all(&handshake.to_bytes())
            .map_err(NbdError::Io)?;
        stream.flush().map_err(NbdError::Io)?;

        debug!("Negotiated export of {} bytes", handshake.size);
        Ok(())
    }

    fn read_request<S: Read>(stream: &mut S) -> Result<Option<NbdRequest>> {
        let mut buf = [0u8; NbdRequest::SIZE_BYTES];
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(NbdError::Truncated("request")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(NbdError::Io(e)),
            }
        }

        NbdRequest::from_bytes(&buf).map(Some)
    }

    fn send_reply<S: Write>(stream: &mut S, reply: NbdReply, payload: &[u8]) -> Result<()> {
        stream.write_all(&reply.to_bytes()).map_err(NbdError::Io)?;
        if !payload.is_empty() {
            stream.write_all(payload).map_err(NbdError::Io)?;
        }
        stream.flush().map_err(NbdError::Io)
    }

    fn reject<S: Write>(stream: &mut S, request: &NbdRequest, err: NbdError) -> Result<Trip> {
        warn!(
            "Rejecting {:?} at offset {} length {}: {}",
            request.command, request.offset, request.length, err
        );
        Self::send_reply(stream, NbdReply::error(request.handle, err.reply_code()), &[])?;
        Ok(Trip::Rejected(err))
    }

    /// Reads one request, honors it against the export and writes the reply.
    ///
    /// Errors returned from here leave the stream in an undefined state and
    /// must end the connection.
    pub fn trip<S: Read + Write>(&mut self, stream: &mut S) -> Result<Trip> {
        let request = match Self::read_request(stream)? {
            Some(request) => request,
            None => return Ok(Trip::Hangup),
        };

        debug!(
            "Request {:?} handle {:#x} offset {} length {}",
            request.command, request.handle, request.offset, request.length
        );

        if request.command != NbdCommand::Disconnect && request.length > NBD_MAX_BUFFER_SIZE {
            return Err(NbdError::RequestTooLarge(request.length));
        }

        let len = request.length as usize;
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }

        match request.command {
            NbdCommand::Read => {
                if let Err(e) = request.check_bounds(self.export.size()) {
                    return Self::reject(stream, &request, e);
                }

                let buf = &mut self.buffer[..len];
                if let Err(e) = self.export.read_at(request.offset, buf) {
                    return Self::reject(stream, &request, NbdError::Export(e));
                }

                Self::send_reply(stream, NbdReply::ok(request.handle), &self.buffer[..len])?;
                Ok(Trip::Served)
            }
            NbdCommand::Write => {
                // Drain the payload first so the stream stays in sync whatever
                // the outcome.
                read_exact_or(stream, &mut self.buffer[..len], "write payload")?;

                if self.readonly {
                    return Self::reject(stream, &request, NbdError::ReadOnly);
                }

                if let Err(e) = request.check_bounds(self.export.size()) {
                    return Self::reject(stream, &request, e);
                }

                if let Err(e) = self.export.write_at(request.offset, &self.buffer[..len]) {
                    return Self::reject(stream, &request, NbdError::Export(e));
                }

                Self::send_reply(stream, NbdReply::ok(request.handle), &[])?;
                Ok(Trip::Served)
            }
            NbdCommand::Disconnect => Ok(Trip::Disconnect),
        }
    }

    /// Runs a whole session: handshake, then requests until the client
    /// disconnects or hangs up.
    pub fn serve<S: Read + Write>(&mut self, stream: &mut S) -> Result<()> {
        self.negotiate(stream)?;

        loop {
            match self.trip(stream)? {
                Trip::Served | Trip::Rejected(_) => {}
                Trip::Disconnect => {
                    info!("Client disconnected");
                    return Ok(());
                }
                Trip::Hangup => {
                    info!("Client closed the connection");
                    return Ok(());
                }
            }
        }
    }
}
