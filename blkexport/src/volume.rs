//! Backing volumes.
//!
//! A [`Volume`] is a fixed-size, random-access byte store. Raw image files
//! are the production backend; [`MemVolume`] backs tests. Snapshot mode
//! wraps any volume in a copy-on-write overlay held in memory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use nix::libc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::VolumeError;
use crate::types::SECTOR_SIZE;

/// Open-time behavior of a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    pub read_only: bool,
    /// Keep writes in a private overlay, discarded on exit.
    pub snapshot: bool,
    /// Write through to stable storage on every write.
    pub nocache: bool,
}

/// Fixed-size random-access storage.
pub trait Volume: Send + Sync {
    fn size_bytes(&self) -> u64;

    fn is_read_only(&self) -> bool;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError>;

    fn flush(&self) -> Result<(), VolumeError>;

    /// Read one 512-byte sector.
    fn read_sector(&self, sector: u64) -> Result<[u8; SECTOR_SIZE], VolumeError> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_at(sector * SECTOR_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    fn write_zeroes(&self, offset: u64, length: u64) -> Result<(), VolumeError> {
        const ZERO_CHUNK: usize = 64 * 1024;
        let zeroes = [0u8; ZERO_CHUNK];
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let n = ((end - pos) as usize).min(ZERO_CHUNK);
            self.write_at(pos, &zeroes[..n])?;
            pos += n as u64;
        }
        Ok(())
    }
}

fn check_bounds(offset: u64, length: usize, size: u64) -> Result<(), VolumeError> {
    match offset.checked_add(length as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(VolumeError::OutOfBounds {
            offset,
            length: length as u64,
            size,
        }),
    }
}

/// Open a raw image according to `flags`.
pub fn open_volume(path: &Path, flags: VolumeFlags) -> Result<Arc<dyn Volume>, VolumeError> {
    // A snapshot never touches the image, so the file itself is opened
    // read-only; the overlay decides whether clients may write.
    let file_read_only = flags.read_only || flags.snapshot;
    let file = FileVolume::open(path, file_read_only, flags.nocache)?;
    debug!(
        path = %path.display(),
        size_bytes = file.size_bytes(),
        ?flags,
        "opened volume"
    );

    if flags.snapshot {
        Ok(Arc::new(SnapshotVolume::new(Arc::new(file), flags.read_only)))
    } else {
        Ok(Arc::new(file))
    }
}

/// Raw image file.
pub struct FileVolume {
    file: File,
    size_bytes: u64,
    read_only: bool,
}

impl FileVolume {
    pub fn open(path: &Path, read_only: bool, nocache: bool) -> Result<Self, VolumeError> {
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);
        if nocache {
            options.custom_flags(libc::O_DSYNC);
        }
        let file = options.open(path).map_err(|source| VolumeError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let size_bytes = file.metadata()?.len();
        Ok(Self {
            file,
            size_bytes,
            read_only,
        })
    }
}

impl Volume for FileVolume {
    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        check_bounds(offset, buf.len(), self.size_bytes)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        if self.read_only {
            return Err(VolumeError::ReadOnly);
        }
        check_bounds(offset, data.len(), self.size_bytes)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), VolumeError> {
        if !self.read_only {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// In-memory volume.
pub struct MemVolume {
    data: RwLock<Vec<u8>>,
    read_only: bool,
}

impl MemVolume {
    pub fn new(size_bytes: usize) -> Self {
        Self::from_bytes(vec![0u8; size_bytes])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

impl Volume for MemVolume {
    fn size_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        let data = self.data.read();
        check_bounds(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<(), VolumeError> {
        if self.read_only {
            return Err(VolumeError::ReadOnly);
        }
        let mut data = self.data.write();
        check_bounds(offset, src.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn flush(&self) -> Result<(), VolumeError> {
        Ok(())
    }
}

const OVERLAY_CHUNK: u64 = 4096;

/// Copy-on-write overlay over a base volume.
///
/// Writes land in memory at [`OVERLAY_CHUNK`] granularity; the base is only
/// ever read.
pub struct SnapshotVolume {
    base: Arc<dyn Volume>,
    overlay: Mutex<HashMap<u64, Box<[u8]>>>,
    read_only: bool,
}

impl SnapshotVolume {
    pub fn new(base: Arc<dyn Volume>, read_only: bool) -> Self {
        Self {
            base,
            overlay: Mutex::new(HashMap::new()),
            read_only,
        }
    }

    fn chunk_len(&self, chunk: u64) -> usize {
        let start = chunk * OVERLAY_CHUNK;
        (self.base.size_bytes() - start).min(OVERLAY_CHUNK) as usize
    }

    /// Walk `[offset, offset + len)` chunk by chunk, yielding
    /// `(chunk index, offset within chunk, offset within caller buffer, count)`.
    fn for_each_chunk(
        offset: u64,
        len: usize,
        mut f: impl FnMut(u64, usize, usize, usize) -> Result<(), VolumeError>,
    ) -> Result<(), VolumeError> {
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let chunk = pos / OVERLAY_CHUNK;
            let in_chunk = (pos % OVERLAY_CHUNK) as usize;
            let n = (len - done).min(OVERLAY_CHUNK as usize - in_chunk);
            f(chunk, in_chunk, done, n)?;
            done += n;
        }
        Ok(())
    }
}

impl Volume for SnapshotVolume {
    fn size_bytes(&self) -> u64 {
        self.base.size_bytes()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        check_bounds(offset, buf.len(), self.size_bytes())?;
        let overlay = self.overlay.lock();
        Self::for_each_chunk(offset, buf.len(), |chunk, in_chunk, at, n| {
            match overlay.get(&chunk) {
                Some(data) => buf[at..at + n].copy_from_slice(&data[in_chunk..in_chunk + n]),
                None => self
                    .base
                    .read_at(chunk * OVERLAY_CHUNK + in_chunk as u64, &mut buf[at..at + n])?,
            }
            Ok(())
        })
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<(), VolumeError> {
        if self.read_only {
            return Err(VolumeError::ReadOnly);
        }
        check_bounds(offset, src.len(), self.size_bytes())?;
        let mut overlay = self.overlay.lock();
        Self::for_each_chunk(offset, src.len(), |chunk, in_chunk, at, n| {
            if !overlay.contains_key(&chunk) {
                let mut data = vec![0u8; self.chunk_len(chunk)].into_boxed_slice();
                self.base.read_at(chunk * OVERLAY_CHUNK, &mut data)?;
                overlay.insert(chunk, data);
            }
            if let Some(data) = overlay.get_mut(&chunk) {
                data[in_chunk..in_chunk + n].copy_from_slice(&src[at..at + n]);
            }
            Ok(())
        })
    }

    fn flush(&self) -> Result<(), VolumeError> {
        Ok(())
    }
}
