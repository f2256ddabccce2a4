//! Heartbeat Monitor
//!
//! Sends a keep-alive envelope every `interval` and watches for acks. The
//! connection is healthy while the last ack is at most `interval + timeout`
//! old. Both checks run on a one second cadence against recorded timestamps;
//! sub-second precision is not needed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xianyu_core::{generate_mid, Envelope, HeartbeatConfig, OutboundSender};

use crate::tasks::{BackgroundTask, SessionSignal};

/// Cadence of the heartbeat loop
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Timestamps of the last heartbeat sent and the last ack received
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatState {
    pub last_sent: Option<Instant>,
    pub last_ack: Option<Instant>,
}

/// Result of one heartbeat tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was due
    Idle,
    /// A heartbeat was written
    Sent { mid: String },
    /// Writing the heartbeat failed; the loop keeps running
    SendFailed { reason: String },
    /// No ack within the tolerated window
    Stale { silent: Duration },
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatStatus {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub last_sent_age_ms: Option<u64>,
    pub last_ack_age_ms: Option<u64>,
    pub is_healthy: bool,
}

struct HeartbeatShared {
    config: HeartbeatConfig,
    state: Mutex<HeartbeatState>,
    outbound: OutboundSender,
}

impl HeartbeatShared {
    fn state(&self) -> MutexGuard<'_, HeartbeatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn silent_for(&self, now: Instant) -> Option<Duration> {
        self.state()
            .last_ack
            .map(|ack| now.saturating_duration_since(ack))
    }

    fn is_healthy_at(&self, now: Instant) -> bool {
        self.silent_for(now)
            .is_some_and(|silent| silent <= self.config.staleness_threshold())
    }

    async fn tick(&self) -> TickOutcome {
        let now = Instant::now();
        let due = self
            .state()
            .last_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.config.interval());

        let mut outcome = TickOutcome::Idle;
        if due {
            let mid = generate_mid();
            match self.outbound.send(&Envelope::heartbeat(mid.clone())).await {
                Ok(()) => {
                    self.state().last_sent = Some(Instant::now());
                    debug!(%mid, "Heartbeat sent");
                    outcome = TickOutcome::Sent { mid };
                }
                Err(e) => {
                    warn!("Failed to send heartbeat: {}", e);
                    outcome = TickOutcome::SendFailed {
                        reason: e.to_string(),
                    };
                }
            }
        }

        if !self.is_healthy_at(now) {
            let silent = self
                .silent_for(now)
                .unwrap_or_else(|| self.config.staleness_threshold());
            return TickOutcome::Stale { silent };
        }
        outcome
    }

    fn status(&self) -> HeartbeatStatus {
        let now = Instant::now();
        let state = *self.state();
        let age = |at: Option<Instant>| at.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        HeartbeatStatus {
            interval_secs: self.config.interval_secs,
            timeout_secs: self.config.timeout_secs,
            last_sent_age_ms: age(state.last_sent),
            last_ack_age_ms: age(state.last_ack),
            is_healthy: self.is_healthy_at(now),
        }
    }
}

// ----------------------------------------------------------------------------
// Heartbeat Monitor
// ----------------------------------------------------------------------------

/// Keep-alive sender and liveness watchdog for one connection at a time
pub struct HeartbeatMonitor {
    shared: Arc<HeartbeatShared>,
    task: Option<BackgroundTask>,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig, outbound: OutboundSender) -> Self {
        Self {
            shared: Arc::new(HeartbeatShared {
                config: config.clone(),
                state: Mutex::new(HeartbeatState::default()),
                outbound,
            }),
            task: None,
        }
    }

    /// Seed both timestamps so a fresh connection is not judged stale
    pub fn initialize(&self) {
        let now = Instant::now();
        *self.shared.state() = HeartbeatState {
            last_sent: Some(now),
            last_ack: Some(now),
        };
    }

    /// Record an ack if `envelope` is one.
    ///
    /// Returns `true` iff the envelope carries a message id and a success
    /// status; anything else is left for generic routing.
    pub fn on_ack(&self, envelope: &Envelope) -> bool {
        if !envelope.is_success() {
            return false;
        }
        let now = Instant::now();
        let mut state = self.shared.state();
        state.last_ack = Some(state.last_ack.map_or(now, |prev| prev.max(now)));
        debug!("Heartbeat ack received");
        true
    }

    /// Whether an ack arrived within `interval + timeout`
    pub fn is_healthy(&self) -> bool {
        self.shared.is_healthy_at(Instant::now())
    }

    /// Run one iteration of the loop body
    pub async fn tick(&self) -> TickOutcome {
        self.shared.tick().await
    }

    /// Start the tick loop. Returns `false` if it is already running.
    pub fn start(&mut self, signals: mpsc::UnboundedSender<SessionSignal>) -> bool {
        if self.is_running() {
            return false;
        }
        let shared = self.shared.clone();
        self.task = Some(BackgroundTask::spawn("heartbeat", move |mut stop| async move {
            loop {
                if let TickOutcome::Stale { silent } = shared.tick().await {
                    warn!(silent_ms = silent.as_millis() as u64, "Heartbeat ack overdue, connection considered stale");
                    let _ = signals.send(SessionSignal::HeartbeatStale { silent });
                    return;
                }
                if !stop.sleep(TICK_INTERVAL).await {
                    return;
                }
            }
        }));
        info!("Heartbeat monitor started");
        true
    }

    /// Stop the tick loop, letting an in-progress send finish first.
    /// Returns `false` if nothing was running.
    pub async fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.stop_and_wait().await;
                info!("Heartbeat monitor stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(BackgroundTask::is_running)
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.shared.status()
    }

    /// Read-only handle for status reporting
    pub fn handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            shared: self.shared.clone(),
        }
    }
}

/// Status view of a [`HeartbeatMonitor`]
#[derive(Clone)]
pub struct HeartbeatHandle {
    shared: Arc<HeartbeatShared>,
}

impl HeartbeatHandle {
    pub fn status(&self) -> HeartbeatStatus {
        self.shared.status()
    }
}
