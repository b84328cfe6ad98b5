//! NBD serving for the export.
//!
//! - [`NbdServer`] handles a single connection (handshake, negotiation, I/O)
//! - [`Listener`] abstracts over connection sources (TCP, Unix, channels)
//! - [`VolumeHandler`] maps transmission requests onto the export window
//!
//! Accepting connections and admission live in the daemon.

mod handler;
mod listener;
mod server;

pub use handler::{HandlerResult, TransmissionHandler, VolumeHandler};
pub use listener::{Endpoint, Listener, StreamListener};
pub use server::{NbdExport, NbdServer};
