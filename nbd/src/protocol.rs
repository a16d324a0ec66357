// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Wire format of the oldstyle NBD protocol.
//!
//! All integers are big-endian. A connection starts with a fixed 152 byte
//! handshake sent by the server, then carries strictly alternating
//! 28 byte requests and 16 byte replies. READ replies are followed by the
//! payload, WRITE requests are followed by the payload.

use std::io::{self, ErrorKind, Read};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

pub const NBD_INIT_MAGIC: &[u8; 8] = b"NBDMAGIC";
pub const NBD_CLISERV_MAGIC: u64 = 0x0042_0281_8612_53;
pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;

/// Block size a client derives once the handshake completed.
pub const NBD_BLOCK_SIZE: u32 = 1024;

/// Largest READ or WRITE payload the server buffers.
pub const NBD_MAX_BUFFER_SIZE: u32 = 32 * 1024 * 1024;

// Error codes carried by replies.
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = libc::EPERM as u32;
pub const NBD_EIO: u32 = libc::EIO as u32;
pub const NBD_EINVAL: u32 = libc::EINVAL as u32;

#[derive(Error, Debug)]
pub enum NbdError {
    #[error("Invalid handshake magic")]
    InvalidInitMagic,
    #[error("Invalid protocol magic {0:#x}")]
    InvalidCliservMagic(u64),
    #[error("Invalid request magic {0:#x}")]
    InvalidRequestMagic(u32),
    #[error("Invalid reply magic {0:#x}")]
    InvalidReplyMagic(u32),
    #[error("Unknown request type {0}")]
    UnknownRequestType(u32),
    #[error("Reply handle {actual:#x} does not match request handle {expected:#x}")]
    HandleMismatch { expected: u64, actual: u64 },
    #[error("Connection closed while reading {0}")]
    Truncated(&'static str),
    #[error("Request length {0} exceeds the server buffer size")]
    RequestTooLarge(u32),
    #[error(
        "Request at offset {offset} with length {length} is past the end of the {size} bytes export"
    )]
    OutOfBounds { offset: u64, length: u32, size: u64 },
    #[error("Write request on a read-only export")]
    ReadOnly,
    #[error("Server replied with error code {0}")]
    Remote(u32),
    #[error("Export I/O failed")]
    Export(#[source] io::Error),
    #[error("Invalid NBD address: {0}")]
    InvalidAddress(String),
    #[error("Failed to connect to NBD server")]
    Connect(#[source] io::Error),
    #[error("Transport error")]
    Io(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, NbdError>;

impl NbdError {
    /// Whether the peer broke the framing or magic rules of the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            NbdError::InvalidInitMagic
                | NbdError::InvalidCliservMagic(_)
                | NbdError::InvalidRequestMagic(_)
                | NbdError::InvalidReplyMagic(_)
                | NbdError::UnknownRequestType(_)
                | NbdError::HandleMismatch { .. }
                | NbdError::Truncated(_)
                | NbdError::RequestTooLarge(_)
        )
    }

    /// Error code to put in a reply when this error is reported to a client.
    pub fn reply_code(&self) -> u32 {
        match self {
            NbdError::ReadOnly => NBD_EPERM,
            NbdError::OutOfBounds { .. } => NBD_EINVAL,
            NbdError::Export(e) => e
                .raw_os_error()
                .filter(|code| *code > 0)
                .map(|code| code as u32)
                .unwrap_or(NBD_EIO),
            _ => NBD_EIO,
        }
    }
}

/// Reads exactly `buf.len()` bytes, reporting a premature end of stream as
/// a truncated `what`.
pub(crate) fn read_exact_or<R: Read + ?Sized>(
    stream: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<()> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => NbdError::Truncated(what),
        _ => NbdError::Io(e),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
}

impl NbdCommand {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(NbdCommand::Read),
            NBD_CMD_WRITE => Some(NbdCommand::Write),
            NBD_CMD_DISC => Some(NbdCommand::Disconnect),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            NbdCommand::Read => NBD_CMD_READ,
            NbdCommand::Write => NBD_CMD_WRITE,
            NbdCommand::Disconnect => NBD_CMD_DISC,
        }
    }
}

/// Server greeting, 152 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub size: u64,
}

impl Handshake {
    pub const SIZE_BYTES: usize = 152;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(NBD_INIT_MAGIC);
        BigEndian::write_u64(&mut buf[8..16], NBD_CLISERV_MAGIC);
        BigEndian::write_u64(&mut buf[16..24], self.size);
        // The remaining 128 bytes are reserved and stay zeroed.
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self> {
        if &buf[0..8] != NBD_INIT_MAGIC {
            return Err(NbdError::InvalidInitMagic);
        }

        let magic = BigEndian::read_u64(&buf[8..16]);
        if magic != NBD_CLISERV_MAGIC {
            return Err(NbdError::InvalidCliservMagic(magic));
        }

        Ok(Handshake {
            size: BigEndian::read_u64(&buf[16..24]),
        })
    }
}

/// Client request, 28 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NbdRequest {
    pub command: NbdCommand,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        BigEndian::write_u32(&mut buf[0..4], NBD_REQUEST_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.command.to_u32());
        BigEndian::write_u64(&mut buf[8..16], self.handle);
        BigEndian::write_u64(&mut buf[16..24], self.offset);
        BigEndian::write_u32(&mut buf[24..28], self.length);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self> {
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidRequestMagic(magic));
        }

        let type_ = BigEndian::read_u32(&buf[4..8]);
        let command = NbdCommand::from_u32(type_).ok_or(NbdError::UnknownRequestType(type_))?;

        Ok(NbdRequest {
            command,
            handle: BigEndian::read_u64(&buf[8..16]),
            offset: BigEndian::read_u64(&buf[16..24]),
            length: BigEndian::read_u32(&buf[24..28]),
        })
    }

    /// Checks the request range against an export of `size` bytes.
    pub fn check_bounds(&self, size: u64) -> Result<()> {
        match self.offset.checked_add(u64::from(self.length)) {
            Some(end) if end <= size => Ok(()),
            _ => Err(NbdError::OutOfBounds {
                offset: self.offset,
                length: self.length,
                size,
            }),
        }
    }
}

/// Server reply, 16 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        NbdReply {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        NbdReply { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        BigEndian::write_u32(&mut buf[0..4], NBD_REPLY_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.error);
        BigEndian::write_u64(&mut buf[8..16], self.handle);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self> {
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != NBD_REPLY_MAGIC {
            return Err(NbdError::InvalidReplyMagic(magic));
        }

        Ok(NbdReply {
            error: BigEndian::read_u32(&buf[4..8]),
            handle: BigEndian::read_u64(&buf[8..16]),
        })
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(Handshake::SIZE_BYTES == 152);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let buf = Handshake { size: 0x1122_3344 }.to_bytes();
        assert_eq!(&buf[0..8], b"NBDMAGIC");
        assert_eq!(
            &buf[8..16],
            &[0x00, 0x00, 0x42, 0x02, 0x81, 0x86, 0x12, 0x53]
        );
        assert_eq!(&buf[16..24], &[0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44]);
        assert!(buf[24..].iter().all(|b| *b == 0));
        assert_eq!(Handshake::from_bytes(&buf).unwrap().size, 0x1122_3344);
    }

    #[test]
    fn test_handshake_bad_magic() {
        let mut buf = Handshake { size: 1 << 20 }.to_bytes();
        buf[0] = b'X';
        assert!(matches!(
            Handshake::from_bytes(&buf),
            Err(NbdError::InvalidInitMagic)
        ));

        let mut buf = Handshake { size: 1 << 20 }.to_bytes();
        buf[15] ^= 0xff;
        let err = Handshake::from_bytes(&buf).unwrap_err();
        assert!(matches!(err, NbdError::InvalidCliservMagic(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_request_layout() {
        let req = NbdRequest {
            command: NbdCommand::Write,
            handle: 0x0102_0304_0506_0708,
            offset: 4096,
            length: 512,
        };
        let buf = req.to_bytes();
        assert_eq!(&buf[0..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[16..24], &[0, 0, 0, 0, 0, 0, 0x10, 0]);
        assert_eq!(&buf[24..28], &[0, 0, 2, 0]);
        assert_eq!(NbdRequest::from_bytes(&buf).unwrap(), req);
    }

    #[test]
    fn test_request_invalid() {
        let mut buf = [0u8; NbdRequest::SIZE_BYTES];
        BigEndian::write_u32(&mut buf[0..4], 0xdead_beef);
        assert!(matches!(
            NbdRequest::from_bytes(&buf),
            Err(NbdError::InvalidRequestMagic(0xdead_beef))
        ));

        BigEndian::write_u32(&mut buf[0..4], NBD_REQUEST_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], 7);
        assert!(matches!(
            NbdRequest::from_bytes(&buf),
            Err(NbdError::UnknownRequestType(7))
        ));
    }

    #[test]
    fn test_request_bounds() {
        let size = 1 << 20;
        let mut req = NbdRequest {
            command: NbdCommand::Read,
            handle: 1,
            offset: size - 512,
            length: 512,
        };
        assert!(req.check_bounds(size).is_ok());

        req.offset = size - 256;
        let err = req.check_bounds(size).unwrap_err();
        assert!(matches!(err, NbdError::OutOfBounds { .. }));
        assert_eq!(err.reply_code(), NBD_EINVAL);
        assert!(!err.is_protocol_violation());

        // offset + length wraps around.
        req.offset = u64::MAX - 10;
        assert!(req.check_bounds(u64::MAX).is_err());
    }

    #[test]
    fn test_reply_layout() {
        let buf = NbdReply::error(42, NBD_EPERM).to_bytes();
        assert_eq!(&buf[0..4], &[0x67, 0x44, 0x66, 0x98]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        let reply = NbdReply::from_bytes(&buf).unwrap();
        assert_eq!(reply.error, NBD_EPERM);
        assert_eq!(reply.handle, 42);

        let mut buf = NbdReply::ok(1).to_bytes();
        buf[0] = 0;
        assert!(matches!(
            NbdReply::from_bytes(&buf),
            Err(NbdError::InvalidReplyMagic(_))
        ));
    }

    #[test]
    fn test_reply_code() {
        assert_eq!(NbdError::ReadOnly.reply_code(), NBD_EPERM);
        assert_eq!(
            NbdError::Export(io::Error::from_raw_os_error(libc::ENOSPC)).reply_code(),
            libc::ENOSPC as u32
        );
        assert_eq!(
            NbdError::Export(io::Error::other("no errno")).reply_code(),
            NBD_EIO
        );
    }
}
