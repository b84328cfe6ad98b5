//! Error types for blkexport.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use nbd::NbdError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type. Everything here is fatal at startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("partition lookup failed: {0}")]
    Partition(#[from] PartitionError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(
        "export window out of range: offset {offset} + length {length} exceeds volume size {volume_size}"
    )]
    WindowOutOfRange {
        offset: u64,
        length: u64,
        volume_size: u64,
    },
}

/// Backing volume errors.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("out of bounds: offset {offset} + length {length} exceeds size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("volume is read-only")]
    ReadOnly,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Partition table lookup errors.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("error while reading sector {sector}: {source}")]
    Read { sector: u64, source: VolumeError },

    #[error("no partition table (missing 0x55aa boot signature)")]
    NoPartitionTable,

    #[error("partition {index} not found")]
    NotFound { index: u32 },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Device bridge failures. Every one of them ends the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect { endpoint: String, source: io::Error },

    #[error("session negotiation failed: {0}")]
    Negotiation(#[from] NbdError),

    #[error("failed to open {path}: {source}")]
    DeviceOpen { path: PathBuf, source: io::Error },

    #[error("failed to attach session to {path}: {source}")]
    Attach { path: PathBuf, source: io::Error },

    #[error("device {path} failed while serving: {source}")]
    Pump { path: PathBuf, source: io::Error },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The protocol engine refused a freshly accepted connection.
#[derive(Debug, Error)]
pub enum AdmissionRejected {
    #[error("export is closed")]
    ExportClosed,
}
