//! Transmission-phase operation handling.
//!
//! The server decodes requests and hands them to a [`TransmissionHandler`].
//! [`VolumeHandler`] maps export-relative ranges onto the backing volume
//! through the [`ExportWindow`] and runs the actual I/O on the blocking pool
//! so the accept loop never waits on disk.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::VolumeError;
use crate::types::ExportWindow;
use crate::volume::Volume;

/// Result of an NBD operation.
pub type HandlerResult<T> = std::result::Result<T, VolumeError>;

#[async_trait]
pub trait TransmissionHandler: Send + Sync {
    async fn read(&self, offset: u64, length: usize) -> HandlerResult<Bytes>;

    async fn write(&self, offset: u64, data: Bytes) -> HandlerResult<()>;

    /// Discard hint; may be a no-op.
    async fn trim(&self, offset: u64, length: u64) -> HandlerResult<()>;

    async fn write_zeroes(&self, offset: u64, length: u64) -> HandlerResult<()>;

    async fn flush(&self) -> HandlerResult<()>;
}

/// Serves an export window of a [`Volume`].
pub struct VolumeHandler {
    volume: Arc<dyn Volume>,
    window: ExportWindow,
}

impl VolumeHandler {
    pub fn new(volume: Arc<dyn Volume>, window: ExportWindow) -> Self {
        Self { volume, window }
    }

    async fn blocking<T, F>(&self, f: F) -> HandlerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Volume) -> HandlerResult<T> + Send + 'static,
    {
        let volume = Arc::clone(&self.volume);
        tokio::task::spawn_blocking(move || f(volume.as_ref()))
            .await
            .map_err(|e| VolumeError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl TransmissionHandler for VolumeHandler {
    async fn read(&self, offset: u64, length: usize) -> HandlerResult<Bytes> {
        let pos = self.window.translate(offset, length as u64)?;
        self.blocking(move |volume| {
            let mut buf = BytesMut::zeroed(length);
            volume.read_at(pos, &mut buf)?;
            Ok(buf.freeze())
        })
        .await
    }

    async fn write(&self, offset: u64, data: Bytes) -> HandlerResult<()> {
        let pos = self.window.translate(offset, data.len() as u64)?;
        self.blocking(move |volume| volume.write_at(pos, &data)).await
    }

    async fn trim(&self, offset: u64, length: u64) -> HandlerResult<()> {
        self.window.translate(offset, length)?;
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, length: u64) -> HandlerResult<()> {
        let pos = self.window.translate(offset, length)?;
        self.blocking(move |volume| volume.write_zeroes(pos, length))
            .await
    }

    async fn flush(&self) -> HandlerResult<()> {
        self.blocking(|volume| volume.flush()).await
    }
}
