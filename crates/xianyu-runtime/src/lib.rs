//! Xianyu Live Runtime
//!
//! This crate contains the session-and-concurrency layer of the live chat
//! client:
//! - `ConnectionSupervisor`: the connect → register → sync → listen state loop
//! - `HeartbeatMonitor` and `TokenManager`: the periodic session loops
//! - `ConversationBatcher`: per-conversation burst smoothing
//! - Frame ingress, manual mode and the reply pipeline
//!
//! `xianyu-core` provides the protocol types this runtime drives.

pub mod batcher;
pub mod builder;
pub mod heartbeat;
pub mod ingress;
pub mod manual;
pub mod pipeline;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod tasks;
pub mod token;

pub use batcher::{AddOutcome, BatchSink, BatcherStatus, CleanupReport, ConversationBatcher};
pub use builder::{RuntimeBuilder, RuntimeHandle};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStatus, TickOutcome};
pub use ingress::{FrameIngress, RouteOutcome};
pub use manual::{is_toggle_keyword, ConversationMode, ManualModeRegistry, ManualModeStatus};
pub use pipeline::{ReplyGenerator, ReplyPipeline};
pub use session::{Session, SessionStatus, SupervisorState};
pub use status::SystemStatus;
pub use supervisor::{ConnectionSupervisor, TeardownCause};
pub use tasks::SessionSignal;
pub use token::{access_token_from, StaticTokenSource, TokenManager, TokenSource, TokenStatus};

// Re-export core types for convenience
pub use xianyu_core::{ChatMessage, LiveConfig, LiveError, LiveResult, TokenError};
