//! Connection admission control.
//!
//! Owned by the accept loop and only touched from it: accepts and close
//! notifications are both handled on the loop, so plain counters suffice.

/// Tracks live clients against the configured cap.
#[derive(Debug)]
pub struct AdmissionController {
    active_clients: usize,
    max_clients: usize,
    has_ever_accepted: bool,
}

impl AdmissionController {
    pub fn new(max_clients: usize) -> Self {
        Self {
            active_clients: 0,
            max_clients,
            has_ever_accepted: false,
        }
    }

    /// Whether the loop should call `accept()` at all.
    pub fn can_accept(&self) -> bool {
        self.active_clients < self.max_clients
    }

    /// Record a connection the protocol engine agreed to serve.
    pub fn on_accepted(&mut self) {
        self.active_clients += 1;
        self.has_ever_accepted = true;
    }

    pub fn on_client_closed(&mut self) {
        self.active_clients = self.active_clients.saturating_sub(1);
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn has_ever_accepted(&self) -> bool {
        self.has_ever_accepted
    }

    /// At least one client came and all of them left.
    pub fn is_drained(&self) -> bool {
        self.has_ever_accepted && self.active_clients == 0
    }
}
