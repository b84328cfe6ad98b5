//! NBD (Network Block Device) protocol support.
//!
//! Wire types and constants for the fixed-newstyle protocol, an async
//! client, and control of Linux kernel NBD devices.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `device` - Linux kernel NBD device support (requires root at runtime)

mod client;
mod protocol;

#[cfg(feature = "device")]
mod device;

pub use client::NbdClient;
pub use protocol::*;

#[cfg(feature = "device")]
pub use device::{KernelDevice, disconnect_device, rescan_partitions};
