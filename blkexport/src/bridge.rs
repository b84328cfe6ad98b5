//! Local device bridge.
//!
//! Connects back to our own listening endpoint as an NBD client, hands the
//! negotiated socket to a kernel NBD device and blocks in the kernel until
//! the device goes away. Whatever happens, the bridge raises termination
//! when it is done so the server follows it down.

use std::io;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use nbd::{KernelDevice, NbdClient, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, error, info};

use crate::error::{BridgeError, NbdError};
use crate::lifecycle::Termination;
use crate::nbd::Endpoint;

/// Kernel-facing half of the bridge.
pub trait DeviceDriver: Send + 'static {
    type Device: Send;

    fn open(&self, path: &Path) -> io::Result<Self::Device>;

    fn attach(&self, device: &mut Self::Device, socket: OwnedFd, session: &Session)
    -> io::Result<()>;

    /// Fire-and-forget partition rescan.
    fn rescan(&self, device: &Self::Device);

    /// Block until the session ends.
    fn pump(&self, device: &mut Self::Device) -> io::Result<()>;
}

/// Linux `/dev/nbdX` devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelDriver;

impl DeviceDriver for KernelDriver {
    type Device = KernelDevice;

    fn open(&self, path: &Path) -> io::Result<KernelDevice> {
        KernelDevice::open(path)
    }

    fn attach(
        &self,
        device: &mut KernelDevice,
        socket: OwnedFd,
        session: &Session,
    ) -> io::Result<()> {
        device.attach(socket, session)
    }

    fn rescan(&self, device: &KernelDevice) {
        let path = device.path();
        if let Err(e) = nbd::rescan_partitions(path.to_path_buf()) {
            debug!(device = %path.display(), error = %e, "partition rescan not started");
        }
    }

    fn pump(&self, device: &mut KernelDevice) -> io::Result<()> {
        device.run()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    Success,
    Failure,
}

/// A bridge running on its own thread.
pub struct BridgeHandle {
    thread: JoinHandle<BridgeOutcome>,
}

impl BridgeHandle {
    /// Wait for the bridge. A panicked bridge counts as a failure.
    pub fn join(self) -> BridgeOutcome {
        self.thread.join().unwrap_or(BridgeOutcome::Failure)
    }
}

pub struct DeviceBridge<D: DeviceDriver = KernelDriver> {
    endpoint: Endpoint,
    device_path: PathBuf,
    export_name: String,
    driver: D,
    termination: Termination,
}

impl<D: DeviceDriver> DeviceBridge<D> {
    pub fn new(
        endpoint: Endpoint,
        device_path: PathBuf,
        export_name: String,
        driver: D,
        termination: Termination,
    ) -> Self {
        Self {
            endpoint,
            device_path,
            export_name,
            driver,
            termination,
        }
    }

    /// Run the bridge on a dedicated thread.
    pub fn spawn(self) -> io::Result<BridgeHandle> {
        let thread = std::thread::Builder::new()
            .name("nbd-bridge".into())
            .spawn(move || self.run())?;
        Ok(BridgeHandle { thread })
    }

    /// Run the bridge to completion on the calling thread.
    pub fn run(self) -> BridgeOutcome {
        let _terminate = TerminateOnExit(&self.termination);

        match self.attach_and_pump() {
            Ok(()) => {
                info!(device = %self.device_path.display(), "device session ended");
                BridgeOutcome::Success
            }
            Err(e) => {
                error!(device = %self.device_path.display(), error = %e, "device bridge failed");
                BridgeOutcome::Failure
            }
        }
    }

    fn attach_and_pump(&self) -> Result<(), BridgeError> {
        let (socket, session) = self.negotiate()?;
        debug!(
            size_bytes = session.size_bytes,
            flags = session.transmission_flags,
            block_size = session.block_size,
            "negotiated device session"
        );

        let mut device =
            self.driver
                .open(&self.device_path)
                .map_err(|source| BridgeError::DeviceOpen {
                    path: self.device_path.clone(),
                    source,
                })?;

        self.driver
            .attach(&mut device, socket, &session)
            .map_err(|source| BridgeError::Attach {
                path: self.device_path.clone(),
                source,
            })?;
        info!(
            device = %self.device_path.display(),
            endpoint = %self.endpoint,
            "device attached"
        );

        self.driver.rescan(&device);

        self.driver
            .pump(&mut device)
            .map_err(|source| BridgeError::Pump {
                path: self.device_path.clone(),
                source,
            })
    }

    /// Connect to the endpoint and negotiate on a private runtime, then give
    /// back the socket in blocking mode for the kernel.
    fn negotiate(&self) -> Result<(OwnedFd, Session), BridgeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.connect_and_negotiate())
    }

    async fn connect_and_negotiate(&self) -> Result<(OwnedFd, Session), BridgeError> {
        let connect_err = |source| BridgeError::Connect {
            endpoint: self.endpoint.to_string(),
            source,
        };
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_err)?;
                let (stream, session) = handshake(stream, &self.export_name).await?;
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                Ok((OwnedFd::from(stream), session))
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
                stream.set_nodelay(true)?;
                let (stream, session) = handshake(stream, &self.export_name).await?;
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                Ok((OwnedFd::from(stream), session))
            }
        }
    }
}

async fn handshake<S>(stream: S, export_name: &str) -> Result<(S, Session), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client = NbdClient::connect(stream, export_name).await?;
    let session = client.session();
    Ok((client.into_inner(), session))
}

struct TerminateOnExit<'a>(&'a Termination);

impl Drop for TerminateOnExit<'_> {
    fn drop(&mut self) {
        self.0.raise();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nbd::{NbdCommand, NbdRequest};

    use super::*;
    use crate::export::Export;
    use crate::types::ExportWindow;
    use crate::volume::MemVolume;

    #[derive(Default)]
    struct FakeDriver {
        fail_open: bool,
        fail_attach: bool,
        rescans: Arc<AtomicUsize>,
    }

    struct FakeDevice {
        socket: Option<OwnedFd>,
        session: Option<Session>,
    }

    impl DeviceDriver for FakeDriver {
        type Device = FakeDevice;

        fn open(&self, _path: &Path) -> io::Result<FakeDevice> {
            if self.fail_open {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(FakeDevice {
                socket: None,
                session: None,
            })
        }

        fn attach(
            &self,
            device: &mut FakeDevice,
            socket: OwnedFd,
            session: &Session,
        ) -> io::Result<()> {
            if self.fail_attach {
                return Err(io::Error::from_raw_os_error(nix::libc::EBUSY));
            }
            device.socket = Some(socket);
            device.session = Some(*session);
            Ok(())
        }

        fn rescan(&self, _device: &FakeDevice) {
            self.rescans.fetch_add(1, Ordering::SeqCst);
        }

        /// Behave like a kernel asked to disconnect: send DISC and return.
        fn pump(&self, device: &mut FakeDevice) -> io::Result<()> {
            let session = device.session.ok_or(io::ErrorKind::NotConnected)?;
            assert_eq!(session.size_bytes, 1024 * 1024);
            let socket = device.socket.take().ok_or(io::ErrorKind::NotConnected)?;
            let mut stream = StdUnixStream::from(socket);
            let disc = NbdRequest {
                flags: 0,
                command: NbdCommand::Disconnect,
                handle: 0,
                offset: 0,
                length: 0,
            };
            stream.write_all(&disc.encode())
        }
    }

    fn bridge(endpoint: Endpoint, driver: FakeDriver) -> (DeviceBridge<FakeDriver>, Termination) {
        let termination = Termination::new();
        let bridge = DeviceBridge::new(
            endpoint,
            PathBuf::from("/dev/nbd-test"),
            "mem".to_string(),
            driver,
            termination.clone(),
        );
        (bridge, termination)
    }

    /// Serve one client of a 1 MiB export on `listener`.
    async fn serve_one(listener: tokio::net::UnixListener) {
        let export = Export::create(
            Arc::new(MemVolume::new(1024 * 1024)),
            ExportWindow::whole(1024 * 1024),
            "mem",
            false,
        );
        let (stream, _) = listener.accept().await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        export
            .register_client(stream, "bridge".into(), move || {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();
    }

    #[test]
    fn connect_failure_raises_termination() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, termination) = bridge(
            Endpoint::Unix(dir.path().join("missing.sock")),
            FakeDriver::default(),
        );

        assert_eq!(bridge.run(), BridgeOutcome::Failure);
        assert!(termination.is_raised());
        assert!(!termination.raise());
    }

    #[test]
    fn negotiation_failure_raises_termination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.sock");
        let listener = StdUnixListener::bind(&path).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[0xde; 18]).unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        let rescans = Arc::new(AtomicUsize::new(0));
        let (bridge, termination) = bridge(
            Endpoint::Unix(path),
            FakeDriver {
                rescans: Arc::clone(&rescans),
                ..Default::default()
            },
        );

        assert_eq!(bridge.run(), BridgeOutcome::Failure);
        assert!(termination.is_raised());
        assert_eq!(rescans.load(Ordering::SeqCst), 0);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn device_open_failure_raises_termination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener));

        let (bridge, termination) = bridge(
            Endpoint::Unix(path),
            FakeDriver {
                fail_open: true,
                ..Default::default()
            },
        );

        let outcome = tokio::task::spawn_blocking(move || bridge.run())
            .await
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::Failure);
        assert!(termination.is_raised());
        // The dropped socket ends the server-side session.
        server.await.unwrap();
    }

    #[tokio::test]
    async fn attach_failure_raises_termination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener));

        let rescans = Arc::new(AtomicUsize::new(0));
        let (bridge, termination) = bridge(
            Endpoint::Unix(path),
            FakeDriver {
                fail_attach: true,
                rescans: Arc::clone(&rescans),
                ..Default::default()
            },
        );

        let outcome = tokio::task::spawn_blocking(move || bridge.run())
            .await
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::Failure);
        assert!(termination.is_raised());
        assert_eq!(rescans.load(Ordering::SeqCst), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn clean_session_end_succeeds_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener));

        let rescans = Arc::new(AtomicUsize::new(0));
        let (bridge, termination) = bridge(
            Endpoint::Unix(path),
            FakeDriver {
                rescans: Arc::clone(&rescans),
                ..Default::default()
            },
        );

        let handle = bridge.spawn().unwrap();
        let outcome = tokio::task::spawn_blocking(move || handle.join())
            .await
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::Success);
        assert_eq!(rescans.load(Ordering::SeqCst), 1);
        assert!(!termination.raise());
        server.await.unwrap();
    }
}
