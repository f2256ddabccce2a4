//! Aggregated status snapshot

use serde::Serialize;

use crate::batcher::BatcherStatus;
use crate::heartbeat::HeartbeatStatus;
use crate::manual::ManualModeStatus;
use crate::session::SessionStatus;
use crate::token::TokenStatus;

/// Everything an external status endpoint reports. Taking a snapshot has no
/// side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub session: SessionStatus,
    pub heartbeat: HeartbeatStatus,
    pub token: TokenStatus,
    pub batcher: BatcherStatus,
    pub manual_mode: ManualModeStatus,
}

impl SystemStatus {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
