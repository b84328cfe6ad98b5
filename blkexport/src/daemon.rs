//! The serving event loop.
//!
//! [`ServerContext`] bundles the export with admission, lifecycle and
//! termination state. [`ServerContext::serve`] drives them from a single
//! task: it accepts while admission allows, counts clients out as their
//! sessions end, and unwinds once the lifecycle says so.
//!
//! ```ignore
//! let context = ServerContext::from_config(&config)?;
//! let listener = TcpListener::bind(addr).await?;
//! let outcome = context.serve(listener, None).await;
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::bridge::{BridgeHandle, BridgeOutcome};
use crate::config::{Config, ExportConfig};
use crate::error::Result;
use crate::export::Export;
use crate::lifecycle::{LifecycleState, ServerLifecycle, Termination};
use crate::nbd::Listener;
use crate::partition;
use crate::types::ExportWindow;
use crate::volume::{Volume, open_volume};

/// How the server ended; maps to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Success,
    Failure,
}

impl ServeOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Everything the accept loop owns.
pub struct ServerContext {
    export: Export,
    admission: AdmissionController,
    lifecycle: ServerLifecycle,
    termination: Termination,
    socket_path: Option<PathBuf>,
    closed_tx: mpsc::UnboundedSender<()>,
    closed_rx: mpsc::UnboundedReceiver<()>,
}

impl ServerContext {
    pub fn new(
        export: Export,
        max_clients: usize,
        persistent: bool,
        socket_path: Option<PathBuf>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            export,
            admission: AdmissionController::new(max_clients),
            lifecycle: ServerLifecycle::new(persistent),
            termination: Termination::new(),
            socket_path,
            closed_tx,
            closed_rx,
        }
    }

    /// Open the image, resolve the export window and build the context.
    pub fn from_config(config: &Config) -> Result<Self> {
        let volume = open_volume(&config.export.image, config.export.volume_flags())?;
        let window = resolve_window(volume.as_ref(), &config.export)?;

        let export = Export::create(
            volume,
            window,
            config.export.name.clone(),
            config.export.read_only,
        );
        info!(
            image = %config.export.image.display(),
            window = %window,
            read_only = export.is_read_only(),
            "export ready"
        );

        let endpoint = config.endpoint();
        Ok(Self::new(
            export,
            config.server.shared,
            config.server.persistent,
            endpoint.socket_path().map(Path::to_path_buf),
        ))
    }

    /// Handle for signal handlers and the device bridge.
    pub fn termination(&self) -> Termination {
        self.termination.clone()
    }

    pub fn export(&self) -> &Export {
        &self.export
    }

    /// Serve until the lifecycle shuts down, then close the export and
    /// report the final outcome. A bridge, if given, is joined and its
    /// outcome wins.
    pub async fn serve<L: Listener>(mut self, mut listener: L, bridge: Option<BridgeHandle>) -> ServeOutcome {
        info!(
            export = %self.export.name(),
            max_clients = self.admission.max_clients(),
            "accepting connections"
        );

        let mut listening = true;
        while self
            .lifecycle
            .evaluate(&self.admission, self.termination.is_raised())
            == LifecycleState::Waiting
        {
            let can_accept = listening && self.admission.can_accept();

            tokio::select! {
                _ = self.termination.wait() => {}
                Some(()) = self.closed_rx.recv() => {
                    self.admission.on_client_closed();
                    info!(active = self.admission.active_clients(), "client disconnected");
                }
                accepted = listener.accept(), if can_accept => match accepted {
                    Ok((stream, peer)) => admit(
                        &self.export,
                        &mut self.admission,
                        &self.closed_tx,
                        stream,
                        peer,
                    ),
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("listener closed");
                        listening = false;
                    }
                    Err(e) => {
                        // Errors such as EMFILE persist until a client leaves.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.export.close();
        if let Some(path) = self.socket_path.as_deref() {
            remove_socket(path);
        }

        let Some(bridge) = bridge else {
            info!("server stopped");
            return ServeOutcome::Success;
        };
        match tokio::task::spawn_blocking(move || bridge.join()).await {
            Ok(BridgeOutcome::Success) => {
                info!("server stopped");
                ServeOutcome::Success
            }
            Ok(BridgeOutcome::Failure) => ServeOutcome::Failure,
            Err(e) => {
                warn!(error = %e, "device bridge join failed");
                ServeOutcome::Failure
            }
        }
    }
}

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Compute the export window for `export` on `volume`.
pub fn resolve_window(volume: &dyn Volume, export: &ExportConfig) -> Result<ExportWindow> {
    let volume_size = volume.size_bytes();
    let window = match export.partition {
        Some(index) => partition::resolve(volume, index)?,
        None if export.offset > 0 => ExportWindow::from_offset(export.offset, volume_size)?,
        None => ExportWindow::whole(volume_size),
    };
    window.validate(volume_size)?;
    Ok(window)
}

fn admit<S>(
    export: &Export,
    admission: &mut AdmissionController,
    closed_tx: &mpsc::UnboundedSender<()>,
    stream: S,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let closed_tx = closed_tx.clone();
    let registered = export.register_client(stream, peer.clone(), move || {
        let _ = closed_tx.send(());
    });

    match registered {
        Ok(()) => {
            admission.on_accepted();
            info!(
                %peer,
                active = admission.active_clients(),
                max = admission.max_clients(),
                "client connected"
            );
        }
        Err(e) => warn!(%peer, error = %e, "client rejected"),
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nbd::NbdClient;
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::bridge::{DeviceBridge, KernelDriver};
    use crate::error::{Error, PartitionError};
    use crate::nbd::{Endpoint, StreamListener};
    use crate::volume::MemVolume;

    const MIB: u64 = 1024 * 1024;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn mem_context(size: u64, max_clients: usize, persistent: bool) -> ServerContext {
        let export = Export::create(
            Arc::new(MemVolume::new(size as usize)),
            ExportWindow::whole(size),
            "",
            false,
        );
        ServerContext::new(export, max_clients, persistent, None)
    }

    /// A 64 KiB image whose only partition covers sectors 8..24, filled
    /// with 0xC3.
    fn partitioned_image() -> Vec<u8> {
        let mut image = vec![0u8; 64 * 1024];
        let entry = &mut image[446..462];
        entry[0] = 0x80;
        entry[4] = 0x83;
        entry[8..12].copy_from_slice(&8u32.to_le_bytes());
        entry[12..16].copy_from_slice(&16u32.to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;
        image[8 * 512..24 * 512].fill(0xC3);
        image
    }

    #[tokio::test]
    async fn transient_server_exits_after_client_disconnects() {
        let context = mem_context(10 * MIB, 1, false);
        let (tx, listener) = StreamListener::<DuplexStream>::new(1);
        let server = tokio::spawn(context.serve(listener, None));

        let (client_io, server_io) = duplex(1024 * 1024);
        tx.send(server_io).await.unwrap();

        let mut client = NbdClient::connect(client_io, "").await.unwrap();
        assert_eq!(client.session().size_bytes, 10 * MIB);
        assert_eq!(client.read(0, 4096).await.unwrap().len(), 4096);
        client.disconnect().await.unwrap();

        let outcome = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert_eq!(outcome, ServeOutcome::Success);
    }

    #[tokio::test]
    async fn transient_server_waits_for_first_client() {
        let context = mem_context(MIB, 1, false);
        let termination = context.termination();
        let (_tx, listener) = StreamListener::<DuplexStream>::new(1);
        let server = tokio::spawn(context.serve(listener, None));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        termination.raise();
        let outcome = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert!(outcome.is_success());
    }

    struct ExhaustedListener(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Listener for ExhaustedListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, String)> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from_raw_os_error(nix::libc::EMFILE))
        }
    }

    #[tokio::test]
    async fn failing_accept_backs_off() {
        let context = mem_context(MIB, 1, false);
        let termination = context.termination();
        let attempts = Arc::new(AtomicUsize::new(0));
        let server = tokio::spawn(context.serve(ExhaustedListener(Arc::clone(&attempts)), None));

        tokio::time::sleep(Duration::from_millis(250)).await;
        termination.raise();
        let outcome = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();

        assert!(outcome.is_success());
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((1..=5).contains(&attempts), "{attempts} accept attempts");
    }

    #[tokio::test]
    async fn full_server_defers_accept_until_a_client_leaves() {
        let context = mem_context(MIB, 1, true);
        let termination = context.termination();
        let (tx, listener) = StreamListener::<DuplexStream>::new(2);
        let server = tokio::spawn(context.serve(listener, None));

        let (first_io, server_io) = duplex(1024 * 1024);
        tx.send(server_io).await.unwrap();
        let first = NbdClient::connect(first_io, "").await.unwrap();

        let (second_io, server_io) = duplex(1024 * 1024);
        tx.send(server_io).await.unwrap();
        let second = tokio::spawn(NbdClient::connect(second_io, ""));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        first.disconnect().await.unwrap();
        let second = tokio::time::timeout(TIMEOUT, second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        second.disconnect().await.unwrap();

        // Persistent: still running with no clients.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        termination.raise();
        let outcome = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn termination_cancels_connected_clients() {
        let context = mem_context(MIB, 2, false);
        let termination = context.termination();
        let (tx, listener) = StreamListener::<DuplexStream>::new(1);
        let server = tokio::spawn(context.serve(listener, None));

        let (client_io, server_io) = duplex(1024 * 1024);
        tx.send(server_io).await.unwrap();
        let mut client = NbdClient::connect(client_io, "").await.unwrap();

        termination.raise();
        let outcome = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert!(outcome.is_success());
        assert!(client.read(0, 512).await.is_err());
    }

    #[tokio::test]
    async fn serves_resolved_partition_from_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, partitioned_image()).unwrap();

        let mut config = Config::default();
        config.export.image = image;
        config.export.partition = Some(1);
        config.export.read_only = true;
        let context = ServerContext::from_config(&config).unwrap();
        assert_eq!(
            context.export().window(),
            ExportWindow {
                offset: 8 * 512,
                length: 16 * 512,
            }
        );

        let (tx, listener) = StreamListener::<DuplexStream>::new(1);
        let server = tokio::spawn(context.serve(listener, None));
        let (client_io, server_io) = duplex(1024 * 1024);
        tx.send(server_io).await.unwrap();

        let mut client = NbdClient::connect(client_io, "").await.unwrap();
        assert_eq!(client.session().size_bytes, 16 * 512);
        assert!(client.session().is_read_only());
        let data = client.read(0, 16 * 512).await.unwrap();
        assert!(data.iter().all(|&b| b == 0xC3));
        client.disconnect().await.unwrap();

        let outcome = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn missing_partition_is_fatal_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, partitioned_image()).unwrap();

        let mut config = Config::default();
        config.export.image = image;
        config.export.partition = Some(3);
        assert!(matches!(
            ServerContext::from_config(&config),
            Err(Error::Partition(PartitionError::NotFound { index: 3 }))
        ));
    }

    #[test]
    fn offset_window_covers_rest_of_volume() {
        let volume = MemVolume::new(8192);
        let export = ExportConfig {
            offset: 1024,
            ..Default::default()
        };
        let window = resolve_window(&volume, &export).unwrap();
        assert_eq!(
            window,
            ExportWindow {
                offset: 1024,
                length: 7168,
            }
        );

        let past_end = ExportConfig {
            offset: 8193,
            ..Default::default()
        };
        assert!(matches!(
            resolve_window(&volume, &past_end),
            Err(Error::WindowOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_removes_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("blkexport.sock");
        std::fs::write(&socket, b"").unwrap();

        let export = Export::create(
            Arc::new(MemVolume::new(4096)),
            ExportWindow::whole(4096),
            "",
            false,
        );
        let context = ServerContext::new(export, 1, false, Some(socket.clone()));
        context.termination().raise();

        let (_tx, listener) = StreamListener::<DuplexStream>::new(1);
        assert!(context.serve(listener, None).await.is_success());
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn failed_bridge_stops_server_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let context = mem_context(MIB, 1, true);

        // Nothing listens on this path, so the bridge fails to connect.
        let bridge = DeviceBridge::new(
            Endpoint::Unix(dir.path().join("absent.sock")),
            PathBuf::from("/dev/nbd-test"),
            String::new(),
            KernelDriver,
            context.termination(),
        )
        .spawn()
        .unwrap();

        let (_tx, listener) = StreamListener::<DuplexStream>::new(1);
        let outcome = tokio::time::timeout(TIMEOUT, context.serve(listener, Some(bridge)))
            .await
            .unwrap();
        assert_eq!(outcome, ServeOutcome::Failure);
    }
}
