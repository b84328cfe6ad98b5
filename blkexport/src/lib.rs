//! blkexport: serve a raw disk image over NBD.
//!
//! The whole image, a byte offset into it or a single MBR partition is
//! exported to a bounded number of concurrent clients. Optionally the export
//! is attached back to a local kernel NBD device, in which case the server
//! lives exactly as long as the device session.
//!
//! # Library Usage
//!
//! ```ignore
//! use blkexport::{Config, ServerContext};
//!
//! let context = ServerContext::from_config(&config)?;
//! let listener = tokio::net::TcpListener::bind(addr).await?;
//! let outcome = context.serve(listener, None).await;
//! ```

pub mod admission;
pub mod bridge;
pub mod config;
pub mod daemon;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod nbd;
pub mod partition;
pub mod types;
pub mod volume;

pub use admission::AdmissionController;
pub use bridge::{BridgeHandle, BridgeOutcome, DeviceBridge, DeviceDriver, KernelDriver};
pub use config::{Config, DeviceConfig, ExportConfig, ServerConfig};
pub use daemon::{ServeOutcome, ServerContext, resolve_window};
pub use error::{
    AdmissionRejected, BridgeError, ConfigError, Error, NbdError, PartitionError, Result,
    VolumeError,
};
pub use export::Export;
pub use lifecycle::{LifecycleState, ServerLifecycle, Termination};
pub use crate::nbd::{Endpoint, Listener, NbdExport, NbdServer, StreamListener, TransmissionHandler};
pub use types::{ExportWindow, PREFERRED_BLOCK_SIZE, SECTOR_SIZE};
pub use volume::{Volume, VolumeFlags, open_volume};
