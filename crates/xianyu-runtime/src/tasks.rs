//! Background task plumbing shared by the periodic session loops
//!
//! - `BackgroundTask`: a spawned loop paired with its stop signal
//! - `StopSignal`: the loop side, used to make waits cancellable
//! - `SessionSignal`: what background loops report to the supervisor

use std::future::Future;
use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

// ----------------------------------------------------------------------------
// Session Signals
// ----------------------------------------------------------------------------

/// Events pushed by background loops that end the current listening phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// No heartbeat ack within interval + timeout
    HeartbeatStale { silent: Duration },
    /// A new token was obtained; the server requires a fresh registration
    TokenRefreshed,
    /// The token API rejected the credentials
    CredentialsRejected { reason: String },
}

// ----------------------------------------------------------------------------
// Stop Signal
// ----------------------------------------------------------------------------

/// Loop-side view of a stop request
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
}

impl StopSignal {
    /// Whether a stop was requested (or the owner went away)
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolve once a stop is requested
    pub async fn stopped(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`; returns `false` if stopped first
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Background Task
// ----------------------------------------------------------------------------

/// A spawned periodic loop with a cooperative stop signal
pub struct BackgroundTask {
    name: &'static str,
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl BackgroundTask {
    /// Spawn `body` with the stop signal it must honour at its wait points
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, receiver) = watch::channel(false);
        let handle = tokio::spawn(body(StopSignal { receiver }));
        debug!(task = name, "Background task spawned");
        Self { name, handle, stop }
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Request a stop and wait for the loop to reach a wait point and exit
    pub async fn stop_and_wait(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            debug!(task = self.name, "Background task ended abnormally: {}", e);
        }
    }

    /// Request a stop without waiting for in-flight work
    pub fn stop_detached(self) {
        let _ = self.stop.send(true);
        debug!(task = self.name, "Background task stop requested");
    }
}
