//! Core types for blkexport.

use std::fmt;

use crate::error::{Error, Result, VolumeError};

/// Sector size used for partition tables and sector addressing.
pub const SECTOR_SIZE: usize = 512;

/// Preferred request size advertised to clients.
pub const PREFERRED_BLOCK_SIZE: u32 = 4096;

/// Byte range of the backing volume that clients see.
///
/// Resolved once at startup and immutable afterwards. Client offsets are
/// relative to `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWindow {
    pub offset: u64,
    pub length: u64,
}

impl ExportWindow {
    /// The whole volume.
    pub fn whole(volume_size: u64) -> Self {
        Self {
            offset: 0,
            length: volume_size,
        }
    }

    /// Everything from `offset` to the end of the volume.
    pub fn from_offset(offset: u64, volume_size: u64) -> Result<Self> {
        if offset > volume_size {
            return Err(Error::WindowOutOfRange {
                offset,
                length: 0,
                volume_size,
            });
        }
        Ok(Self {
            offset,
            length: volume_size - offset,
        })
    }

    /// Check that the window lies inside a volume of `volume_size` bytes.
    pub fn validate(&self, volume_size: u64) -> Result<()> {
        match self.offset.checked_add(self.length) {
            Some(end) if end <= volume_size => Ok(()),
            _ => Err(Error::WindowOutOfRange {
                offset: self.offset,
                length: self.length,
                volume_size,
            }),
        }
    }

    /// Translate a client range to an absolute volume offset.
    #[inline]
    pub fn translate(&self, offset: u64, length: u64) -> Result<u64, VolumeError> {
        match offset.checked_add(length) {
            Some(end) if end <= self.length => Ok(self.offset + offset),
            _ => Err(VolumeError::OutOfBounds {
                offset,
                length,
                size: self.length,
            }),
        }
    }
}

impl fmt::Display for ExportWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.length)
    }
}
