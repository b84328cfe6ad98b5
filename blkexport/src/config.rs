//! Configuration for blkexport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::nbd::Endpoint;
use crate::volume::VolumeFlags;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: Option<DeviceConfig>,
}

/// What is exported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Raw disk image to serve.
    pub image: PathBuf,
    /// Export name; empty is the default export.
    pub name: String,
    pub read_only: bool,
    /// Keep writes in memory and discard them on exit.
    pub snapshot: bool,
    /// Write through to stable storage.
    pub nocache: bool,
    /// Byte offset of the export inside the image.
    pub offset: u64,
    /// 1-based MBR partition number to export.
    pub partition: Option<u32>,
}

impl ExportConfig {
    pub fn volume_flags(&self) -> VolumeFlags {
        VolumeFlags {
            read_only: self.read_only,
            snapshot: self.snapshot,
            nocache: self.nocache,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "export.image",
                reason: "must be set",
            });
        }
        if self.partition == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "export.partition",
                reason: "partitions are numbered from 1",
            });
        }
        if self.partition.is_some() && self.offset != 0 {
            return Err(ConfigError::InvalidValue {
                field: "export.offset",
                reason: "cannot be combined with export.partition",
            });
        }
        Ok(())
    }
}

/// Where and how clients are served.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Unix socket path; takes precedence over TCP.
    pub socket: Option<PathBuf>,
    /// Maximum concurrent clients.
    pub shared: usize,
    /// Keep running after the last client disconnects.
    pub persistent: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 10809,
            socket: None,
            shared: 1,
            persistent: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shared == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.shared",
                reason: "must be >= 1",
            });
        }
        if self.socket.as_ref().is_some_and(|s| !s.is_absolute()) {
            return Err(ConfigError::InvalidValue {
                field: "server.socket",
                reason: "must be an absolute path",
            });
        }
        Ok(())
    }
}

/// Local kernel device to attach the export to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub path: PathBuf,
}

impl DeviceConfig {
    /// Socket used when the device is attached and none was configured.
    pub fn default_socket_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nbd".to_string());
        PathBuf::from(format!("/var/lock/blkexport-{name}"))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.export.validate()?;
        self.server.validate()
    }

    /// The listening endpoint.
    ///
    /// An explicit socket wins, then the device's default socket, then TCP.
    pub fn endpoint(&self) -> Endpoint {
        if let Some(ref socket) = self.server.socket {
            return Endpoint::Unix(socket.clone());
        }
        if let Some(ref device) = self.device {
            return Endpoint::Unix(device.default_socket_path());
        }
        Endpoint::Tcp(SocketAddr::new(self.server.bind, self.server.port))
    }
}
