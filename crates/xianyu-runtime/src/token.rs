//! Token Lifecycle Manager
//!
//! Owns the access token used for registration. A token is valid while its
//! age is below the refresh interval. Rotating the token always forces a new
//! registration on the server, so a successful background refresh is reported
//! to the supervisor as [`SessionSignal::TokenRefreshed`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use xianyu_core::{LiveError, LiveResult, TokenConfig, TokenError};

use crate::tasks::{BackgroundTask, SessionSignal};

// ----------------------------------------------------------------------------
// Token Source
// ----------------------------------------------------------------------------

/// External token API
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a token response for `device_id`.
    ///
    /// The response carries the token at `data.accessToken`. Revoked or
    /// expired credentials are reported as [`TokenError::Fatal`].
    async fn fetch(&self, device_id: &str) -> Result<Value, TokenError>;
}

/// Token at `data.accessToken`, if present and non-empty
pub fn access_token_from(response: &Value) -> Option<String> {
    response
        .pointer("/data/accessToken")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Token source that always answers with one pre-provisioned token
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self, _device_id: &str) -> Result<Value, TokenError> {
        match &self.token {
            Some(token) => Ok(json!({ "data": { "accessToken": token } })),
            None => Err(TokenError::fatal("no access token configured")),
        }
    }
}

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Current token and when it was obtained. A token implies a refresh time.
#[derive(Debug, Clone, Default)]
pub struct TokenState {
    token: Option<(String, Instant)>,
}

impl TokenState {
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|(token, _)| token.as_str())
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.token.as_ref().map(|(_, at)| *at)
    }

    fn valid_token(&self, now: Instant, lifetime: Duration) -> Option<&str> {
        self.token
            .as_ref()
            .filter(|(_, at)| now.saturating_duration_since(*at) < lifetime)
            .map(|(token, _)| token.as_str())
    }
}

/// Result of a background refresh check
#[derive(Debug, Clone)]
enum RefreshOutcome {
    NotDue,
    Refreshed,
    Failed(TokenError),
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    pub has_token: bool,
    pub is_valid: bool,
    pub time_until_expiry_secs: Option<u64>,
    pub refresh_interval_secs: u64,
    pub refresh_count: u64,
}

struct TokenShared {
    config: TokenConfig,
    device_id: String,
    source: Arc<dyn TokenSource>,
    state: Mutex<TokenState>,
    /// Serializes refreshes so concurrent callers never fetch twice
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_count: AtomicU64,
}

impl TokenShared {
    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn valid_token(&self) -> Option<String> {
        self.state()
            .valid_token(Instant::now(), self.config.refresh_interval())
            .map(str::to_string)
    }

    /// Fetch a new token and store it. Callers hold the refresh gate.
    async fn refresh(&self) -> Result<String, TokenError> {
        info!("Refreshing access token");
        let response = self.source.fetch(&self.device_id).await?;
        let token = access_token_from(&response)
            .ok_or_else(|| TokenError::transient("token response carries no data.accessToken"))?;
        self.state().token = Some((token.clone(), Instant::now()));
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
        info!("Access token refreshed");
        Ok(token)
    }

    async fn ensure_fresh(&self) -> LiveResult<String> {
        let _gate = self.refresh_gate.lock().await;
        if let Some(token) = self.valid_token() {
            return Ok(token);
        }
        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(e @ TokenError::Fatal { .. }) => {
                error!("Token refresh rejected: {}", e);
                Err(e.into())
            }
            Err(e) => {
                let previous = self.state().token().map(str::to_string);
                match previous {
                    Some(token) => {
                        warn!("Token refresh failed, continuing with the previous token: {}", e);
                        Ok(token)
                    }
                    None => Err(LiveError::from(e)),
                }
            }
        }
    }

    async fn refresh_if_due(&self) -> RefreshOutcome {
        let _gate = self.refresh_gate.lock().await;
        if self.valid_token().is_some() {
            return RefreshOutcome::NotDue;
        }
        match self.refresh().await {
            Ok(_) => RefreshOutcome::Refreshed,
            Err(e) => RefreshOutcome::Failed(e),
        }
    }

    fn status(&self) -> TokenStatus {
        let now = Instant::now();
        let lifetime = self.config.refresh_interval();
        let state = self.state();
        let time_until_expiry_secs = state
            .last_refresh()
            .map(|at| lifetime.saturating_sub(now.saturating_duration_since(at)).as_secs());
        TokenStatus {
            has_token: state.token().is_some(),
            is_valid: state.valid_token(now, lifetime).is_some(),
            time_until_expiry_secs,
            refresh_interval_secs: self.config.refresh_interval_secs,
            refresh_count: self.refresh_count.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Token Manager
// ----------------------------------------------------------------------------

/// Access token owner with an optional background rotation loop
pub struct TokenManager {
    shared: Arc<TokenShared>,
    task: Option<BackgroundTask>,
}

impl TokenManager {
    pub fn new(config: &TokenConfig, device_id: impl Into<String>, source: Arc<dyn TokenSource>) -> Self {
        Self {
            shared: Arc::new(TokenShared {
                config: config.clone(),
                device_id: device_id.into(),
                source,
                state: Mutex::new(TokenState::default()),
                refresh_gate: tokio::sync::Mutex::new(()),
                refresh_count: AtomicU64::new(0),
            }),
            task: None,
        }
    }

    /// Return a valid token, refreshing first when there is none or it expired.
    ///
    /// A transient failure falls back to the previous token when one exists
    /// and is an error otherwise. Rejected credentials are always an error.
    pub async fn ensure_fresh(&self) -> LiveResult<String> {
        self.shared.ensure_fresh().await
    }

    pub fn current_token(&self) -> Option<String> {
        self.shared.state().token().map(str::to_string)
    }

    pub fn is_valid(&self) -> bool {
        self.shared.valid_token().is_some()
    }

    /// Start the background rotation loop. Returns `false` if already running.
    pub fn start(&mut self, signals: mpsc::UnboundedSender<SessionSignal>) -> bool {
        if self.is_running() {
            return false;
        }
        let shared = self.shared.clone();
        self.task = Some(BackgroundTask::spawn("token-refresh", move |mut stop| async move {
            loop {
                let wait = match shared.refresh_if_due().await {
                    RefreshOutcome::NotDue => shared.config.check_interval(),
                    RefreshOutcome::Refreshed => {
                        if !stop.is_stopped() {
                            info!("Token rotated, session must re-register");
                            let _ = signals.send(SessionSignal::TokenRefreshed);
                        }
                        return;
                    }
                    RefreshOutcome::Failed(TokenError::Fatal { reason }) => {
                        error!("Background token refresh rejected: {}", reason);
                        let _ = signals.send(SessionSignal::CredentialsRejected { reason });
                        return;
                    }
                    RefreshOutcome::Failed(e) => {
                        let retry = shared.config.retry_interval();
                        warn!(retry_secs = retry.as_secs(), "Background token refresh failed: {}", e);
                        retry
                    }
                };
                if !stop.sleep(wait).await {
                    return;
                }
            }
        }));
        debug!("Token refresh loop started");
        true
    }

    /// Cancel the loop's wait without awaiting an in-flight refresh.
    /// Returns `false` if nothing was running.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.stop_detached();
                debug!("Token refresh loop stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(BackgroundTask::is_running)
    }

    pub fn status(&self) -> TokenStatus {
        self.shared.status()
    }

    /// Read-only handle for status reporting
    pub fn handle(&self) -> TokenHandle {
        TokenHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Status view of a [`TokenManager`]
#[derive(Clone)]
pub struct TokenHandle {
    shared: Arc<TokenShared>,
}

impl TokenHandle {
    pub fn status(&self) -> TokenStatus {
        self.shared.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Answers from a script, then with a numbered token
    struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<Result<Value, TokenError>>>,
        fetches: AtomicU32,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Value, TokenError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                fetches: AtomicU32::new(0),
            })
        }

        fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn fetch(&self, device_id: &str) -> Result<Value, TokenError> {
            assert_eq!(device_id, "DEVICE-1");
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script.lock().unwrap().pop_front() {
                Some(answer) => answer,
                None => Ok(json!({"data": {"accessToken": format!("token-{n}")}})),
            }
        }
    }

    fn config() -> TokenConfig {
        TokenConfig {
            refresh_interval_secs: 3600,
            retry_interval_secs: 300,
            check_interval_secs: 60,
            access_token: None,
        }
    }

    fn manager(source: Arc<ScriptedSource>) -> TokenManager {
        TokenManager::new(&config(), "DEVICE-1", source)
    }

    #[test]
    fn test_access_token_extraction() {
        assert_eq!(
            access_token_from(&json!({"data": {"accessToken": "abc"}})).as_deref(),
            Some("abc")
        );
        assert!(access_token_from(&json!({"data": {}})).is_none());
        assert!(access_token_from(&json!({"data": {"accessToken": ""}})).is_none());
        assert!(access_token_from(&json!({"ret": ["FAIL_SYS_SESSION_EXPIRED"]})).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_token_is_not_refetched() {
        let source = ScriptedSource::new(vec![]);
        let tokens = manager(source.clone());

        assert_eq!(tokens.ensure_fresh().await.unwrap(), "token-1");
        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(tokens.ensure_fresh().await.unwrap(), "token-1");
        assert_eq!(source.fetches(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(tokens.ensure_fresh().await.unwrap(), "token-2");
        assert_eq!(source.fetches(), 2);
        assert_eq!(tokens.status().time_until_expiry_secs, Some(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_refresh_failure_is_an_error() {
        let source = ScriptedSource::new(vec![Ok(json!({"data": {}}))]);
        let tokens = manager(source);
        let err = tokens.ensure_fresh().await.unwrap_err();
        assert!(matches!(err, LiveError::TokenRefresh { .. }));
        assert!(!err.is_fatal());
        assert!(!tokens.status().has_token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_previous_token() {
        let source = ScriptedSource::new(vec![
            Ok(json!({"data": {"accessToken": "first"}})),
            Err(TokenError::transient("timeout")),
        ]);
        let tokens = manager(source);
        tokens.ensure_fresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(tokens.ensure_fresh().await.unwrap(), "first");
        assert!(!tokens.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_are_fatal() {
        let source = ScriptedSource::new(vec![Err(TokenError::fatal("session expired"))]);
        let tokens = manager(source);
        assert!(tokens.ensure_fresh().await.unwrap_err().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_signals_rotation() {
        let source = ScriptedSource::new(vec![]);
        let mut tokens = manager(source.clone());
        tokens.ensure_fresh().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(tokens.start(tx));
        assert_eq!(rx.recv().await, Some(SessionSignal::TokenRefreshed));
        // rotated on the first check at or after the hour
        assert_eq!(source.fetches(), 2);
        assert_eq!(tokens.current_token().as_deref(), Some("token-2"));
        assert!(!tokens.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_retries_after_retry_interval() {
        let source = ScriptedSource::new(vec![
            Ok(json!({"data": {"accessToken": "first"}})),
            Err(TokenError::transient("timeout")),
        ]);
        let mut tokens = manager(source.clone());
        tokens.ensure_fresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        tokens.start(tx);
        assert_eq!(rx.recv().await, Some(SessionSignal::TokenRefreshed));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(300) && waited < Duration::from_secs(301));
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_rejection_is_reported() {
        let source = ScriptedSource::new(vec![
            Ok(json!({"data": {"accessToken": "first"}})),
            Err(TokenError::fatal("revoked")),
        ]);
        let mut tokens = manager(source);
        tokens.ensure_fresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokens.start(tx);
        assert_eq!(
            rx.recv().await,
            Some(SessionSignal::CredentialsRejected {
                reason: "revoked".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let source = ScriptedSource::new(vec![]);
        let mut tokens = manager(source.clone());
        tokens.ensure_fresh().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(tokens.start(tx.clone()));
        assert!(!tokens.start(tx));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(tokens.stop());
        assert!(!tokens.stop());

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(source.fetches(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticTokenSource::new(Some("abc".into()));
        let response = source.fetch("d").await.unwrap();
        assert_eq!(access_token_from(&response).as_deref(), Some("abc"));
        assert!(matches!(
            StaticTokenSource::new(None).fetch("d").await,
            Err(TokenError::Fatal { .. })
        ));
    }
}
