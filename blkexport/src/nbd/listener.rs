//! Listening transports.
//!
//! [`Endpoint`] names where the server listens; binding it yields a
//! [`Listener`]. Accepting returns the stream plus a printable peer address
//! for logging. [`StreamListener`] feeds in-memory streams for tests.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;

/// Where the server listens and where the device bridge connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Filesystem path to unlink at shutdown, if any.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Unix(path) => Some(path),
            Self::Tcp(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next connection and describe its peer.
    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr.to_string()))
    }
}

#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, addr) = UnixListener::accept(self).await?;
        let peer = addr
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unix:unnamed".to_string());
        Ok((stream, peer))
    }
}

/// A listener that accepts streams pushed through a channel.
///
/// Closing every sender makes `accept` fail with `BrokenPipe`.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
    accepted: u64,
}

impl<S> StreamListener<S> {
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx, accepted: 0 })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let stream = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
        self.accepted += 1;
        Ok((stream, format!("stream#{}", self.accepted)))
    }
}
