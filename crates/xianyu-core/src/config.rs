//! Centralized Configuration
//!
//! All tunables of the session layer live in [`LiveConfig`]. The value is
//! built once at startup and handed to each component's constructor.

use core::time::Duration;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{LiveError, LiveResult};
use crate::types::account_id_from_cookies;

// ----------------------------------------------------------------------------
// WebSocket Configuration
// ----------------------------------------------------------------------------

/// Endpoint and upgrade headers of the chat socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub base_url: String,
    /// Timeout for opening the connection
    pub connect_timeout_secs: u64,
    /// Extra upgrade headers; the `Cookie` header is added from [`LiveConfig::cookies`]
    pub headers: BTreeMap<String, String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        let headers = [
            ("Host", "wss-goofish.dingtalk.com"),
            ("Connection", "Upgrade"),
            ("Pragma", "no-cache"),
            ("Cache-Control", "no-cache"),
            ("User-Agent", DEFAULT_BROWSER_UA),
            ("Origin", "https://www.goofish.com"),
            ("Accept-Encoding", "gzip, deflate, br, zstd"),
            ("Accept-Language", "zh-CN,zh;q=0.9"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            base_url: "wss://wss-goofish.dingtalk.com/".to_string(),
            connect_timeout_secs: 30,
            headers,
        }
    }
}

const DEFAULT_BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

// ----------------------------------------------------------------------------
// Heartbeat Configuration
// ----------------------------------------------------------------------------

/// Keep-alive cadence and liveness tolerance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeats
    pub interval_secs: u64,
    /// Extra seconds of silence tolerated before the connection is stale
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 5,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Longest tolerated gap between acks
    pub fn staleness_threshold(&self) -> Duration {
        self.interval() + self.timeout()
    }
}

// ----------------------------------------------------------------------------
// Token Configuration
// ----------------------------------------------------------------------------

/// Access token rotation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Token lifetime before it is rotated
    pub refresh_interval_secs: u64,
    /// Delay before retrying a failed background refresh
    pub retry_interval_secs: u64,
    /// Cadence of the background expiry check
    pub check_interval_secs: u64,
    /// Pre-provisioned access token for deployments without a token API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 3600,
            retry_interval_secs: 300,
            check_interval_secs: 60,
            access_token: None,
        }
    }
}

impl TokenConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

// ----------------------------------------------------------------------------
// Batching Configuration
// ----------------------------------------------------------------------------

/// Per-conversation burst smoothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Size trigger
    pub max_batch_size: usize,
    /// Debounce window, measured from the last message of the batch
    pub max_wait_time_ms: u64,
    /// Cadence of each debounce watcher
    pub poll_interval_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 3,
            max_wait_time_ms: 1500,
            poll_interval_ms: 500,
        }
    }
}

impl BatchingConfig {
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Message Handling Configuration
// ----------------------------------------------------------------------------

/// Manual takeover of conversations by the seller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualModeConfig {
    /// Seconds after which a manual conversation returns to automatic
    pub timeout_secs: u64,
    /// Seller messages that toggle manual mode when sent verbatim.
    /// Each character of the string is one keyword.
    pub toggle_keywords: String,
}

impl Default for ManualModeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            toggle_keywords: "。".to_string(),
        }
    }
}

impl ManualModeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Inbound message filtering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Messages older than this are dropped
    pub expire_time_ms: u64,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            expire_time_ms: 300_000,
        }
    }
}

/// Client identification sent during registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub app_key: String,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            app_key: "444e9908a51d1cb236a27862abc769c9".to_string(),
            user_agent: format!(
                "{} DingTalk(2.1.5) OS(Windows/10) Browser(Chrome/133.0.0.0) DingWeb/2.1.5 IMPaaS DingWeb/2.1.5",
                DEFAULT_BROWSER_UA
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Supervisor Configuration
// ----------------------------------------------------------------------------

/// Reconnect policy and lifecycle delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Fixed delay before reconnecting after an unrequested teardown
    pub reconnect_backoff_secs: u64,
    /// Pause after registration so the server can apply it
    pub registration_settle_ms: u64,
    /// Time granted to in-flight hand-offs during teardown
    pub cleanup_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: 5,
            registration_settle_ms: 1000,
            cleanup_grace_ms: 2000,
        }
    }
}

impl SupervisorConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn registration_settle(&self) -> Duration {
        Duration::from_millis(self.registration_settle_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `xianyu_runtime=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Complete Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of a live session process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Raw cookie string of the logged-in seller; `unb` is the account id
    pub cookies: String,
    pub websocket: WebSocketConfig,
    pub heartbeat: HeartbeatConfig,
    pub token: TokenConfig,
    pub batching: BatchingConfig,
    pub manual_mode: ManualModeConfig,
    pub message: MessageConfig,
    pub api: ApiConfig,
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
}

impl LiveConfig {
    /// Configuration with short cadences for tests
    pub fn testing() -> Self {
        Self {
            cookies: "unb=10001; cna=test".to_string(),
            heartbeat: HeartbeatConfig {
                interval_secs: 2,
                timeout_secs: 1,
            },
            supervisor: SupervisorConfig {
                reconnect_backoff_secs: 5,
                registration_settle_ms: 10,
                cleanup_grace_ms: 100,
            },
            ..Self::default()
        }
    }

    /// Account id carried in the cookie string
    pub fn account_id(&self) -> LiveResult<String> {
        account_id_from_cookies(&self.cookies)
            .ok_or_else(|| LiveError::config_error("cookies do not contain an `unb` account id"))
    }

    /// Upgrade headers for the socket, including the cookie header
    pub fn connect_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .websocket
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.push(("Cookie".to_string(), self.cookies.clone()));
        headers
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> LiveResult<()> {
        if self.websocket.base_url.trim().is_empty() {
            return Err(LiveError::config_error("websocket.base_url must not be empty"));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(LiveError::config_error("heartbeat.interval_secs must be greater than 0"));
        }
        if self.token.refresh_interval_secs == 0
            || self.token.retry_interval_secs == 0
            || self.token.check_interval_secs == 0
        {
            return Err(LiveError::config_error("token intervals must be greater than 0"));
        }
        if self.batching.max_batch_size == 0 {
            return Err(LiveError::config_error("batching.max_batch_size must be greater than 0"));
        }
        if self.batching.poll_interval_ms == 0 {
            return Err(LiveError::config_error("batching.poll_interval_ms must be greater than 0"));
        }
        self.account_id()?;
        Ok(())
    }
}
