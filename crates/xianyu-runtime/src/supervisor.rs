//! Connection Supervisor
//!
//! Top-level control loop of the live session:
//!
//! `Idle → Connecting → Registering → Syncing → Listening → Teardown → Idle`
//!
//! Every protocol-level failure ends in `Teardown` followed by a reconnect.
//! Only rejected credentials and an explicit shutdown leave the loop.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use xianyu_core::{
    generate_mid, now_millis, ChatMessage, Connection, Envelope, FrameStream, LiveConfig,
    LiveError, LiveResult, Registration, Transport,
};

use crate::batcher::ConversationBatcher;
use crate::heartbeat::HeartbeatMonitor;
use crate::ingress::FrameIngress;
use crate::session::{Session, SupervisorState};
use crate::tasks::SessionSignal;
use crate::token::TokenManager;

// ----------------------------------------------------------------------------
// Teardown Causes
// ----------------------------------------------------------------------------

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownCause {
    ConnectFailed(String),
    RestartRequested,
    TokenRefreshed,
    TransportClosed,
    Error(String),
    Shutdown,
}

impl TeardownCause {
    /// Whether the next connection attempt skips the backoff
    pub fn reconnects_immediately(&self) -> bool {
        matches!(self, TeardownCause::RestartRequested | TeardownCause::TokenRefreshed)
    }
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownCause::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            TeardownCause::RestartRequested => f.write_str("restart requested"),
            TeardownCause::TokenRefreshed => f.write_str("token refreshed"),
            TeardownCause::TransportClosed => f.write_str("transport closed"),
            TeardownCause::Error(reason) => write!(f, "error: {reason}"),
            TeardownCause::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Map a background-loop signal onto the end of the listening phase.
///
/// A stale heartbeat is an error so it takes the backoff path.
fn signal_outcome(signal: SessionSignal) -> LiveResult<TeardownCause> {
    match signal {
        SessionSignal::HeartbeatStale { silent } => Err(LiveError::StaleConnection {
            silent_ms: u64::try_from(silent.as_millis()).unwrap_or(u64::MAX),
        }),
        SessionSignal::TokenRefreshed => Ok(TeardownCause::TokenRefreshed),
        SessionSignal::CredentialsRejected { reason } => {
            Err(LiveError::FatalCredential { reason })
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Supervisor
// ----------------------------------------------------------------------------

pub struct ConnectionSupervisor {
    config: LiveConfig,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    heartbeat: HeartbeatMonitor,
    tokens: TokenManager,
    batcher: ConversationBatcher<ChatMessage>,
    ingress: FrameIngress,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: LiveConfig,
        transport: Arc<dyn Transport>,
        session: Arc<Session>,
        heartbeat: HeartbeatMonitor,
        tokens: TokenManager,
        batcher: ConversationBatcher<ChatMessage>,
        ingress: FrameIngress,
    ) -> Self {
        Self {
            config,
            transport,
            session,
            heartbeat,
            tokens,
            batcher,
            ingress,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run the state loop until shutdown is requested.
    ///
    /// Returns an error only for rejected credentials; the connection is torn
    /// down and the batcher drained before it is returned.
    pub async fn run(&mut self) -> LiveResult<()> {
        info!(
            account = %self.session.identity().account_id,
            endpoint = %self.config.websocket.base_url,
            "Connection supervisor starting"
        );
        let mut shutdown = self.session.subscribe_shutdown();

        while !*shutdown.borrow() {
            let cause = match self.run_connection(&mut shutdown).await {
                Ok(cause) => cause,
                Err(e) if e.is_fatal() => {
                    error!("Unrecoverable session error: {}", e);
                    self.teardown(&TeardownCause::Error(e.to_string())).await;
                    self.session.set_state(SupervisorState::Idle);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Connection failed: {}", e);
                    TeardownCause::Error(e.to_string())
                }
            };

            self.teardown(&cause).await;
            self.session.set_state(SupervisorState::Idle);
            if cause == TeardownCause::Shutdown {
                break;
            }
            if cause.reconnects_immediately() || self.session.restart_requested() {
                info!("Reconnecting immediately");
                continue;
            }

            let backoff = self.config.supervisor.reconnect_backoff();
            info!(backoff_secs = backoff.as_secs(), "Reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
                _ = self.session.restart_notified() => {}
            }
        }

        self.session.set_state(SupervisorState::Idle);
        info!("Connection supervisor stopped");
        Ok(())
    }

    /// One pass from `Connecting` up to the end of `Listening`
    async fn run_connection(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LiveResult<TeardownCause> {
        self.session.set_state(SupervisorState::Connecting);
        self.session.clear_restart();
        let attempt = self.session.record_connection_attempt();
        debug!(attempt, "Opening connection");

        let endpoint = self.config.websocket.base_url.clone();
        let headers = self.config.connect_headers();
        let Connection { sink, stream } = match self.transport.open(&endpoint, &headers).await {
            Ok(connection) => connection,
            Err(e) => return Ok(TeardownCause::ConnectFailed(e.to_string())),
        };
        self.session.outbound().attach(sink).await;
        info!(attempt, "Connection established");

        self.session.set_state(SupervisorState::Registering);
        let token = self.tokens.ensure_fresh().await?;
        let registration = Envelope::registration(
            &Registration {
                token: &token,
                device_id: &self.session.identity().device_id,
                app_key: &self.config.api.app_key,
                user_agent: &self.config.api.user_agent,
            },
            generate_mid(),
        );
        self.session.outbound().send(&registration).await?;
        tokio::time::sleep(self.config.supervisor.registration_settle()).await;

        self.session.set_state(SupervisorState::Syncing);
        self.session
            .outbound()
            .send(&Envelope::sync_ack(now_millis()))
            .await?;
        self.heartbeat.initialize();
        info!("Registration complete");

        self.listen(stream, shutdown).await
    }

    async fn listen(
        &mut self,
        mut stream: Box<dyn FrameStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LiveResult<TeardownCause> {
        self.session.set_state(SupervisorState::Listening);
        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        self.heartbeat.start(signal_tx.clone());
        self.tokens.start(signal_tx);
        let session = self.session.clone();

        loop {
            if *shutdown.borrow() {
                return Ok(TeardownCause::Shutdown);
            }
            if session.restart_requested() {
                return Ok(TeardownCause::RestartRequested);
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = session.restart_notified() => {}
                Some(signal) = signals.recv() => return signal_outcome(signal),
                frame = stream.next_frame() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text).await,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(TeardownCause::TransportClosed),
                },
            }
        }
    }

    /// Ack handling and routing for one inbound frame
    async fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        if self.heartbeat.on_ack(&envelope) {
            return;
        }

        if envelope.has_mid() {
            let ack = Envelope::ack_for(&envelope, generate_mid());
            if let Err(e) = self.session.outbound().send(&ack).await {
                warn!("Failed to acknowledge frame: {}", e);
            }
        }

        let outcome = self.ingress.route(&envelope).await;
        debug!(?outcome, "Frame routed");
    }

    /// Stop background loops, drain the batcher, then close the connection
    async fn teardown(&mut self, cause: &TeardownCause) {
        self.session.set_state(SupervisorState::Teardown);
        info!(%cause, "Tearing down connection");

        self.heartbeat.stop().await;
        self.tokens.stop();
        let report = self
            .batcher
            .cleanup(self.config.supervisor.cleanup_grace())
            .await;
        if report.aborted_handoffs > 0 {
            warn!(aborted = report.aborted_handoffs, "Cancelled unfinished hand-offs");
        }
        self.session.outbound().close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_only_requested_restarts_skip_backoff() {
        assert!(TeardownCause::RestartRequested.reconnects_immediately());
        assert!(TeardownCause::TokenRefreshed.reconnects_immediately());
        assert!(!TeardownCause::TransportClosed.reconnects_immediately());
        assert!(!TeardownCause::ConnectFailed("refused".into()).reconnects_immediately());
        assert!(!TeardownCause::Error("send failed".into()).reconnects_immediately());
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(
            TeardownCause::ConnectFailed("refused".into()).to_string(),
            "connect failed: refused"
        );
        assert_eq!(TeardownCause::TokenRefreshed.to_string(), "token refreshed");
    }

    #[test]
    fn test_stale_heartbeat_surfaces_as_recoverable_error() {
        let err = signal_outcome(SessionSignal::HeartbeatStale {
            silent: Duration::from_millis(21_500),
        })
        .unwrap_err();
        assert!(matches!(err, LiveError::StaleConnection { silent_ms: 21_500 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_signal_outcomes() {
        assert_eq!(
            signal_outcome(SessionSignal::TokenRefreshed).unwrap(),
            TeardownCause::TokenRefreshed
        );
        let err = signal_outcome(SessionSignal::CredentialsRejected {
            reason: "session expired".into(),
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
