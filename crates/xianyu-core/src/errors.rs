//! Error types for the live chat session
//!
//! This module contains the error taxonomy used throughout the session layer:
//! transport failures, frame decoding failures, token refresh failures and the
//! `LiveError` type that unifies them. Every variant except
//! [`LiveError::FatalCredential`] is recoverable at the nearest loop boundary.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
    #[error("Connection attempt timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Invalid transport configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

/// Frame and payload decoding errors
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed JSON frame: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("Envelope shape mismatch: {reason}")]
    EnvelopeMismatch { reason: String },
    #[error("Payload decryption failed: {reason}")]
    DecryptionFailed { reason: String },
    #[error("No decryptor available for opaque payload")]
    Unsupported,
}

/// Failures reported by a token source
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    /// The fetch failed but may succeed later
    #[error("Token fetch failed: {reason}")]
    Transient { reason: String },
    /// The credentials were rejected (expired or revoked cookies)
    #[error("Credentials rejected: {reason}")]
    Fatal { reason: String },
}

impl TokenError {
    pub fn transient<T: Into<String>>(reason: T) -> Self {
        TokenError::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal<T: Into<String>>(reason: T) -> Self {
        TokenError::Fatal {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the live chat session
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Heartbeat watchdog fired
    #[error("Connection stale: no heartbeat ack for {silent_ms}ms")]
    StaleConnection { silent_ms: u64 },

    /// Token refresh failed without a usable token
    #[error("Token refresh failed: {reason}")]
    TokenRefresh { reason: String },

    /// Credentials were rejected by the token API; never retried
    #[error("Fatal credential error: {reason}")]
    FatalCredential { reason: String },

    /// Downstream batch processing failed
    #[error("Batch hand-off failed for conversation {conversation}: {reason}")]
    Handoff {
        conversation: String,
        reason: String,
    },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl From<TokenError> for LiveError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Transient { reason } => LiveError::TokenRefresh { reason },
            TokenError::Fatal { reason } => LiveError::FatalCredential { reason },
        }
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl LiveError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        LiveError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a hand-off error for a conversation
    pub fn handoff<C: Into<String>, R: Into<String>>(conversation: C, reason: R) -> Self {
        LiveError::Handoff {
            conversation: conversation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error must escape the supervisor instead of triggering a reconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, LiveError::FatalCredential { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, LiveError>;
pub type LiveResult<T> = Result<T>;
