//! Session state shared between the supervisor and its handles
//!
//! One per process. The supervisor replaces the connection behind the
//! outbound sender on every reconnect; everything else lives for the whole
//! process. The restart and shutdown requests are the only fields written
//! from outside the supervisor.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::info;
use xianyu_core::{OutboundSender, SessionIdentity};

/// Lifecycle state of the connection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Registering,
    Syncing,
    Listening,
    Teardown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Registering => "registering",
            SupervisorState::Syncing => "syncing",
            SupervisorState::Listening => "listening",
            SupervisorState::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub account_id: String,
    pub device_id: String,
    pub state: SupervisorState,
    pub connected: bool,
    pub restart_requested: bool,
    pub connection_attempts: u64,
    pub frames_sent: u64,
}

pub struct Session {
    identity: SessionIdentity,
    outbound: OutboundSender,
    state: Mutex<SupervisorState>,
    restart_requested: AtomicBool,
    restart_notify: Notify,
    shutdown: watch::Sender<bool>,
    connection_attempts: AtomicU64,
}

impl Session {
    pub fn new(identity: SessionIdentity, outbound: OutboundSender) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            identity,
            outbound,
            state: Mutex::new(SupervisorState::Idle),
            restart_requested: AtomicBool::new(false),
            restart_notify: Notify::new(),
            shutdown,
            connection_attempts: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: SupervisorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    // ------------------------------------------------------------------------
    // Restart Requests
    // ------------------------------------------------------------------------

    /// Ask the supervisor to drop the current connection and reconnect
    /// without backoff
    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
        self.restart_notify.notify_one();
        info!("Connection restart requested");
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_restart(&self) {
        self.restart_requested.store(false, Ordering::SeqCst);
    }

    /// Resolves after the next restart request. May resolve spuriously for a
    /// request that was already cleared; callers re-check the flag.
    pub(crate) async fn restart_notified(&self) {
        self.restart_notify.notified().await;
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("Shutdown requested");
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn record_connection_attempt(&self) -> u64 {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            account_id: self.identity.account_id.clone(),
            device_id: self.identity.device_id.clone(),
            state: self.state(),
            connected: self.outbound.is_attached().await,
            restart_requested: self.restart_requested(),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            frames_sent: self.outbound.frames_sent(),
        }
    }
}
