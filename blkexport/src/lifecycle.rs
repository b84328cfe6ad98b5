//! Server run/stop decision and the process-wide termination flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::debug;

use crate::admission::AdmissionController;

/// Latched termination request.
///
/// Raised by signal handlers and by the device bridge thread; observed by
/// the accept loop. Raising also wakes a loop blocked in [`wait`](Self::wait).
#[derive(Debug, Clone, Default)]
pub struct Termination {
    inner: Arc<TerminationInner>,
}

#[derive(Debug, Default)]
struct TerminationInner {
    raised: AtomicBool,
    notify: Notify,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` for the call that latched it.
    pub fn raise(&self) -> bool {
        let first = !self.inner.raised.swap(true, Ordering::SeqCst);
        if first {
            debug!("termination raised");
        }
        self.inner.notify.notify_waiters();
        first
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a raise in between is not lost.
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Waiting,
    ShuttingDown,
}

/// Decides, once per loop iteration, whether the server keeps running.
#[derive(Debug)]
pub struct ServerLifecycle {
    persistent: bool,
    state: LifecycleState,
}

impl ServerLifecycle {
    pub fn new(persistent: bool) -> Self {
        Self {
            persistent,
            state: LifecycleState::Waiting,
        }
    }

    /// Re-evaluate after a loop iteration. `ShuttingDown` is terminal.
    pub fn evaluate(&mut self, admission: &AdmissionController, terminated: bool) -> LifecycleState {
        if self.state == LifecycleState::Waiting
            && (terminated || (!self.persistent && admission.is_drained()))
        {
            debug!(
                terminated,
                persistent = self.persistent,
                active = admission.active_clients(),
                "server shutting down"
            );
            self.state = LifecycleState::ShuttingDown;
        }
        self.state
    }
}
