//! NBD protocol constants and wire types.
//!
//! Only the fixed-newstyle handshake and simple replies are implemented.
//! Everything on the wire is big-endian.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use std::io;

use bytes::{Buf, BufMut};
use thiserror::Error;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;

// Handshake flags (server)
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Handshake flags (client)
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;

// Options
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;

// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR | 1;
pub const NBD_REP_ERR_POLICY: u32 = NBD_REP_FLAG_ERROR | 2;
pub const NBD_REP_ERR_INVALID: u32 = NBD_REP_FLAG_ERROR | 3;
pub const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR | 6;

// Info types
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

/// Smallest request granularity a server advertises.
pub const NBD_MIN_BLOCK_SIZE: u32 = 1;

/// Block size assumed when the server does not advertise one.
pub const NBD_DEFAULT_BLOCK_SIZE: u32 = 512;

/// Largest READ/WRITE payload (32 MiB).
///
/// Commands without a payload (TRIM, WRITE_ZEROES) are bounded by the
/// export size instead.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Bound on option data and option reply payloads during negotiation.
pub const OPTION_DATA_MAX_BYTES: usize = 64 * 1024;

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;

pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;

// Error codes carried in simple replies
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Transmission-phase command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    Read = NBD_CMD_READ,
    Write = NBD_CMD_WRITE,
    Disconnect = NBD_CMD_DISCONNECT,
    Flush = NBD_CMD_FLUSH,
    Trim = NBD_CMD_TRIM,
    WriteZeroes = NBD_CMD_WRITE_ZEROES,
}

impl NbdCommand {
    /// Whether the request carries (or returns) a data payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }

    /// Largest `length` accepted for this command on an export of
    /// `export_size` bytes.
    ///
    /// Payload commands are capped at [`NBD_MAX_PAYLOAD_SIZE`]; TRIM and
    /// WRITE_ZEROES may span the whole export.
    pub fn length_limit(self, export_size: u64) -> u32 {
        match self {
            Self::Read | Self::Write => NBD_MAX_PAYLOAD_SIZE,
            Self::Trim | Self::WriteZeroes => export_size.min(u32::MAX as u64) as u32,
            Self::Disconnect | Self::Flush => u32::MAX,
        }
    }
}

impl TryFrom<u16> for NbdCommand {
    type Error = NbdError;

    fn try_from(raw: u16) -> Result<Self, NbdError> {
        Ok(match raw {
            NBD_CMD_READ => Self::Read,
            NBD_CMD_WRITE => Self::Write,
            NBD_CMD_DISCONNECT => Self::Disconnect,
            NBD_CMD_FLUSH => Self::Flush,
            NBD_CMD_TRIM => Self::Trim,
            NBD_CMD_WRITE_ZEROES => Self::WriteZeroes,
            command => return Err(NbdError::UnsupportedCommand { command }),
        })
    }
}

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("bad magic 0x{actual:016x} (want 0x{expected:016x})")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("option {option} rejected with reply 0x{reply:08x}")]
    OptionRejected { option: u32, reply: u32 },

    #[error("unsupported command {command}")]
    UnsupportedCommand { command: u16 },

    #[error("length {length_bytes} exceeds limit of {max_bytes} bytes")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("server replied with error {code}")]
    ServerError { code: u32 },

    #[error("reply handle {actual} does not match request {expected}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn check_magic(expected: u64, actual: u64) -> Result<(), NbdError> {
    if expected == actual {
        Ok(())
    } else {
        Err(NbdError::InvalidMagic { expected, actual })
    }
}

/// Parameters the server advertised for the negotiated export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub size_bytes: u64,
    pub transmission_flags: u16,
    /// Preferred block size from `NBD_INFO_BLOCK_SIZE`, or
    /// [`NBD_DEFAULT_BLOCK_SIZE`] when the server sent none.
    pub block_size: u32,
}

impl Session {
    pub fn is_read_only(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_READ_ONLY) != 0
    }

    /// Block size usable for a kernel device.
    ///
    /// The kernel accepts powers of two between 512 and the page size, and
    /// the export size must be a whole number of blocks.
    pub fn device_block_size(&self) -> u32 {
        let bs = self.block_size;
        if bs.is_power_of_two()
            && (512..=4096).contains(&bs)
            && self.size_bytes.is_multiple_of(bs as u64)
        {
            bs
        } else {
            NBD_DEFAULT_BLOCK_SIZE
        }
    }
}

/// Header of an option sent during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionHeader {
    pub option: u32,
    /// Bytes of option data that follow.
    pub length: u32,
}

impl OptionHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut raw = [0u8; Self::SIZE_BYTES];
        let mut buf = &mut raw[..];
        buf.put_u64(NBD_OPTS_MAGIC);
        buf.put_u32(self.option);
        buf.put_u32(self.length);
        raw
    }

    /// Decode and bound the data length by [`OPTION_DATA_MAX_BYTES`].
    pub fn decode(raw: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let mut buf = &raw[..];
        check_magic(NBD_OPTS_MAGIC, buf.get_u64())?;
        let header = Self {
            option: buf.get_u32(),
            length: buf.get_u32(),
        };
        check_option_length(header.length)?;
        Ok(header)
    }
}

/// Header of a server reply to an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionReplyHeader {
    pub option: u32,
    pub reply: u32,
    pub length: u32,
}

impl OptionReplyHeader {
    pub const SIZE_BYTES: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut raw = [0u8; Self::SIZE_BYTES];
        let mut buf = &mut raw[..];
        buf.put_u64(NBD_OPTION_REPLY_MAGIC);
        buf.put_u32(self.option);
        buf.put_u32(self.reply);
        buf.put_u32(self.length);
        raw
    }

    pub fn decode(raw: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let mut buf = &raw[..];
        check_magic(NBD_OPTION_REPLY_MAGIC, buf.get_u64())?;
        let header = Self {
            option: buf.get_u32(),
            reply: buf.get_u32(),
            length: buf.get_u32(),
        };
        check_option_length(header.length)?;
        Ok(header)
    }

    pub fn is_error(&self) -> bool {
        (self.reply & NBD_REP_FLAG_ERROR) != 0
    }
}

fn check_option_length(length: u32) -> Result<(), NbdError> {
    if length as usize > OPTION_DATA_MAX_BYTES {
        return Err(NbdError::RequestTooLarge {
            length_bytes: length,
            max_bytes: OPTION_DATA_MAX_BYTES as u32,
        });
    }
    Ok(())
}

/// Transmission-phase request.
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: NbdCommand,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut raw = [0u8; Self::SIZE_BYTES];
        let mut buf = &mut raw[..];
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(self.flags);
        buf.put_u16(self.command as u16);
        buf.put_u64(self.handle);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        raw
    }

    /// Handle of a raw request, readable even when the rest fails to parse.
    pub fn peek_handle(raw: &[u8; Self::SIZE_BYTES]) -> u64 {
        (&raw[8..16]).get_u64()
    }

    /// Decode and check `length` against [`NbdCommand::length_limit`].
    pub fn decode(raw: &[u8; Self::SIZE_BYTES], export_size: u64) -> Result<Self, NbdError> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        check_magic(NBD_REQUEST_MAGIC as u64, magic as u64)?;

        let flags = buf.get_u16();
        let command = NbdCommand::try_from(buf.get_u16())?;
        let request = Self {
            flags,
            command,
            handle: buf.get_u64(),
            offset: buf.get_u64(),
            length: buf.get_u32(),
        };

        let limit = command.length_limit(export_size);
        if request.length > limit {
            return Err(NbdError::RequestTooLarge {
                length_bytes: request.length,
                max_bytes: limit,
            });
        }
        Ok(request)
    }
}

/// Simple reply; READ data follows it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self::error(handle, NBD_OK)
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut raw = [0u8; Self::SIZE_BYTES];
        let mut buf = &mut raw[..];
        buf.put_u32(NBD_SIMPLE_REPLY_MAGIC);
        buf.put_u32(self.error);
        buf.put_u64(self.handle);
        raw
    }

    pub fn decode(raw: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        check_magic(NBD_SIMPLE_REPLY_MAGIC as u64, magic as u64)?;
        Ok(Self {
            error: buf.get_u32(),
            handle: buf.get_u64(),
        })
    }
}
