//! The served export and its per-connection sessions.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdmissionRejected, NbdError};
use crate::nbd::{NbdExport, NbdServer, VolumeHandler};
use crate::types::ExportWindow;
use crate::volume::Volume;

/// One window of one volume, served to every registered client.
pub struct Export {
    server: NbdServer,
    export: NbdExport,
    window: ExportWindow,
    closed: CancellationToken,
}

impl Export {
    /// Build the export. The window must already be validated against the
    /// volume.
    pub fn create(
        volume: Arc<dyn Volume>,
        window: ExportWindow,
        name: impl Into<String>,
        read_only: bool,
    ) -> Self {
        let read_only = read_only || volume.is_read_only();
        let export = NbdExport {
            name: name.into(),
            size_bytes: window.length,
            read_only,
        };
        let server = NbdServer::new(Arc::new(VolumeHandler::new(volume, window)));

        Self {
            server,
            export,
            window,
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.export.name
    }

    pub fn window(&self) -> ExportWindow {
        self.window
    }

    pub fn is_read_only(&self) -> bool {
        self.export.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Start serving `stream` on its own task.
    ///
    /// `on_closed` runs exactly once when the session ends, whether the
    /// client left, the protocol failed or the export was closed. It is not
    /// called when registration is rejected.
    pub fn register_client<S, F>(
        &self,
        stream: S,
        peer: String,
        on_closed: F,
    ) -> Result<(), AdmissionRejected>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        if self.closed.is_cancelled() {
            return Err(AdmissionRejected::ExportClosed);
        }

        let server = self.server.clone();
        let export = self.export.clone();
        let cancelled = self.closed.child_token();

        tokio::spawn(async move {
            let _closed = OnClosed(Some(on_closed));
            tokio::select! {
                result = server.serve(stream, &export) => match result {
                    Ok(()) => debug!(%peer, "session finished"),
                    Err(NbdError::Io(e)) => debug!(%peer, error = %e, "session closed"),
                    Err(e) => warn!(%peer, error = %e, "NBD session error"),
                },
                _ = cancelled.cancelled() => debug!(%peer, "session cancelled"),
            }
        });
        Ok(())
    }

    /// Stop serving. Live sessions are cancelled and further registrations
    /// are rejected.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!(export = %self.export.name, "closing export");
            self.closed.cancel();
        }
    }
}

struct OnClosed<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnClosed<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nbd::NbdClient;
    use tokio::io::duplex;
    use tokio::sync::oneshot;

    use super::*;
    use crate::volume::MemVolume;

    const SIZE: u64 = 1024 * 1024;

    fn export() -> Export {
        Export::create(
            Arc::new(MemVolume::new(SIZE as usize)),
            ExportWindow::whole(SIZE),
            "mem",
            false,
        )
    }

    #[tokio::test]
    async fn disconnect_fires_close_notification() {
        let export = export();
        let (client_io, server_io) = duplex(64 * 1024);
        let (tx, rx) = oneshot::channel();
        export
            .register_client(server_io, "test".into(), move || {
                let _ = tx.send(());
            })
            .unwrap();

        let client = NbdClient::connect(client_io, "mem").await.unwrap();
        assert_eq!(client.session().size_bytes, SIZE);
        client.disconnect().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("close notification")
            .unwrap();
    }

    #[tokio::test]
    async fn close_cancels_live_sessions() {
        let export = export();
        let (_client_io, server_io) = duplex(64 * 1024);
        let (tx, rx) = oneshot::channel();
        export
            .register_client(server_io, "idle".into(), move || {
                let _ = tx.send(());
            })
            .unwrap();

        export.close();
        assert!(export.is_closed());
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("cancelled session did not report close")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_export_rejects_registration() {
        let export = export();
        export.close();

        let (_client_io, server_io) = duplex(1024);
        let result = export.register_client(server_io, "late".into(), || {
            panic!("rejected client must not report close")
        });
        assert!(matches!(result, Err(AdmissionRejected::ExportClosed)));
    }

    #[test]
    fn read_only_volume_forces_read_only_export() {
        let export = Export::create(
            Arc::new(MemVolume::new(4096).read_only()),
            ExportWindow::whole(4096),
            "",
            false,
        );
        assert!(export.is_read_only());
        assert_eq!(export.name(), "");
        assert_eq!(export.window(), ExportWindow::whole(4096));
    }
}
