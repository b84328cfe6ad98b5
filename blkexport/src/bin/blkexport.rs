//! blkexport - export a disk image over NBD.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use blkexport::{
    Config, DeviceBridge, DeviceConfig, Endpoint, KernelDriver, Listener, ServerContext,
    Termination,
};

#[derive(Parser)]
#[command(name = "blkexport", version, about = "Export a disk image over NBD")]
struct Cli {
    /// Disk image to export, or the device to detach with --disconnect.
    file: Option<PathBuf>,

    /// Path to config file. Command line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on.
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Listen on a Unix socket instead of TCP.
    #[arg(short = 'k', long)]
    socket: Option<PathBuf>,

    /// Export name.
    #[arg(short = 'x', long)]
    name: Option<String>,

    /// Byte offset of the export inside the image.
    #[arg(short, long)]
    offset: Option<u64>,

    /// Export only this MBR partition (1-based).
    #[arg(short = 'P', long)]
    partition: Option<u32>,

    /// Refuse writes.
    #[arg(short, long)]
    read_only: bool,

    /// Keep writes in memory and discard them on exit.
    #[arg(short, long)]
    snapshot: bool,

    /// Write through to stable storage.
    #[arg(short, long)]
    nocache: bool,

    /// Attach the export to this NBD device.
    #[arg(short, long, value_name = "DEV")]
    connect: Option<PathBuf>,

    /// Detach the device given as FILE and exit.
    #[arg(short, long)]
    disconnect: bool,

    /// Maximum number of concurrent clients.
    #[arg(short = 'e', long)]
    shared: Option<usize>,

    /// Keep serving after the last client disconnects.
    #[arg(short = 't', long)]
    persistent: bool,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn build_config(&self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => Config::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(ref file) = self.file {
            config.export.image = file.clone();
        }
        if let Some(ref name) = self.name {
            config.export.name = name.clone();
        }
        if let Some(offset) = self.offset {
            config.export.offset = offset;
        }
        if let Some(partition) = self.partition {
            config.export.partition = Some(partition);
        }
        config.export.read_only |= self.read_only;
        config.export.snapshot |= self.snapshot;
        config.export.nocache |= self.nocache;

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(ref socket) = self.socket {
            config.server.socket = Some(socket.clone());
        }
        if let Some(shared) = self.shared {
            config.server.shared = shared;
        }
        config.server.persistent |= self.persistent;

        if let Some(ref path) = self.connect {
            config.device = Some(DeviceConfig { path: path.clone() });
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.disconnect {
        let device = cli
            .file
            .context("--disconnect needs the device as FILE")?;
        nbd::disconnect_device(&device)
            .with_context(|| format!("Failed to disconnect {}", device.display()))?;
        info!(device = %device.display(), "disconnected");
        return Ok(ExitCode::SUCCESS);
    }

    let config = cli.build_config()?;
    let context = ServerContext::from_config(&config).context("Failed to set up export")?;
    spawn_signal_handler(context.termination())?;

    let endpoint = config.endpoint();
    let outcome = match endpoint {
        Endpoint::Unix(ref path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)
                .with_context(|| format!("Failed to bind: {}", path.display()))?;
            serve(context, listener, &config, endpoint.clone()).await?
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind: {addr}"))?;
            serve(context, listener, &config, endpoint.clone()).await?
        }
    };

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn serve<L: Listener>(
    context: ServerContext,
    listener: L,
    config: &Config,
    endpoint: Endpoint,
) -> Result<blkexport::ServeOutcome> {
    info!(
        endpoint = %endpoint,
        image = %config.export.image.display(),
        shared = config.server.shared,
        persistent = config.server.persistent,
        "blkexport started"
    );

    // The listener is bound, so the bridge can connect before the loop runs.
    let bridge = match config.device {
        Some(ref device) => Some(
            DeviceBridge::new(
                endpoint,
                device.path.clone(),
                config.export.name.clone(),
                KernelDriver,
                context.termination(),
            )
            .spawn()
            .context("Failed to start device bridge")?,
        ),
        None => None,
    };

    Ok(context.serve(listener, bridge).await)
}

fn spawn_signal_handler(termination: Termination) -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to register SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        termination.raise();
    });
    Ok(())
}
