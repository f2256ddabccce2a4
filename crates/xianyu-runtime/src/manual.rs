//! Manual-mode registry
//!
//! Conversations the seller has taken over are skipped by automatic reply
//! processing until toggled back or until the timeout elapses. Expiry is
//! evaluated lazily on lookup.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;
use xianyu_core::ManualModeConfig;

/// Processing mode of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConversationMode {
    Auto,
    Manual,
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualModeStatus {
    pub timeout_secs: u64,
    pub manual_conversations: Vec<String>,
}

/// Whether `content` is a toggle keyword: the trimmed content must occur
/// somewhere in `keywords`. An empty message matches.
pub fn is_toggle_keyword(keywords: &str, content: &str) -> bool {
    keywords.contains(content.trim())
}

pub struct ManualModeRegistry {
    timeout: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl ManualModeRegistry {
    pub fn new(config: &ManualModeConfig) -> Self {
        Self {
            timeout: config.timeout(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enter(&self, conversation_id: &str) {
        self.entries()
            .insert(conversation_id.to_string(), Instant::now());
        info!(conversation = %conversation_id, "Entered manual mode");
    }

    pub fn exit(&self, conversation_id: &str) {
        if self.entries().remove(conversation_id).is_some() {
            info!(conversation = %conversation_id, "Returned to automatic mode");
        }
    }

    /// Flip the mode of a conversation and return the new mode
    pub fn toggle(&self, conversation_id: &str) -> ConversationMode {
        if self.is_manual(conversation_id) {
            self.exit(conversation_id);
            ConversationMode::Auto
        } else {
            self.enter(conversation_id);
            ConversationMode::Manual
        }
    }

    pub fn is_manual(&self, conversation_id: &str) -> bool {
        let mut entries = self.entries();
        match entries.get(conversation_id) {
            Some(entered) if entered.elapsed() > self.timeout => {
                entries.remove(conversation_id);
                info!(conversation = %conversation_id, "Manual mode timed out");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn status(&self) -> ManualModeStatus {
        let entries = self.entries();
        let mut manual_conversations: Vec<String> = entries
            .iter()
            .filter(|(_, entered)| entered.elapsed() <= self.timeout)
            .map(|(cid, _)| cid.clone())
            .collect();
        manual_conversations.sort();
        ManualModeStatus {
            timeout_secs: self.timeout.as_secs(),
            manual_conversations,
        }
    }
}
