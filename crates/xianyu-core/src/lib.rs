//! Xianyu Live Core
//!
//! This crate provides the protocol value types of the live chat session:
//! the envelope model and its outbound constructors, identifier generation,
//! inbound message classification, the payload codec seam, the transport
//! traits with their serialized write path, configuration, and errors.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod codec;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod message;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{Decryptor, EnvelopeCodec, NoDecryptor, SyncPackageCodec};
pub use config::{
    ApiConfig, BatchingConfig, HeartbeatConfig, LiveConfig, LoggingConfig, ManualModeConfig,
    MessageConfig, SupervisorConfig, TokenConfig, WebSocketConfig,
};
pub use envelope::{routes, Envelope, OutboundText, Registration};
pub use errors::{DecodeError, LiveError, LiveResult, TokenError, TransportError};
pub use message::{classify, ChatMessage, ExtractError, InboundKind, OrderStatus};
pub use transport::{Connection, FrameSink, FrameStream, OutboundSender, Transport};
pub use types::{generate_device_id, generate_mid, generate_uuid, now_millis, SessionIdentity};
