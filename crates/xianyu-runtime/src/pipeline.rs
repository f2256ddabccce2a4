//! Reply pipeline
//!
//! The default batch sink: turns a completed batch into at most one reply and
//! writes it back through the session's outbound sender.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use xianyu_core::{
    generate_mid, generate_uuid, ChatMessage, Envelope, LiveError, LiveResult, OutboundSender,
    OutboundText,
};

use crate::batcher::BatchSink;
use crate::manual::ManualModeRegistry;

/// External reply generation
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Produce a reply for a batch, or `None` to stay silent
    async fn generate(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> LiveResult<Option<String>>;
}

pub struct ReplyPipeline {
    generator: Arc<dyn ReplyGenerator>,
    manual: Arc<ManualModeRegistry>,
    outbound: OutboundSender,
}

impl ReplyPipeline {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        manual: Arc<ManualModeRegistry>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            generator,
            manual,
            outbound,
        }
    }
}

#[async_trait]
impl BatchSink<ChatMessage> for ReplyPipeline {
    async fn handle(&self, conversation_id: &str, messages: Vec<ChatMessage>) -> LiveResult<()> {
        if self.manual.is_manual(conversation_id) {
            debug!(conversation = %conversation_id, size = messages.len(), "Conversation in manual mode, skipping reply");
            return Ok(());
        }
        let Some(last) = messages.last() else {
            return Ok(());
        };

        let reply = self
            .generator
            .generate(conversation_id, &messages)
            .await
            .map_err(|e| LiveError::handoff(conversation_id, e.to_string()))?;
        let Some(text) = reply else {
            debug!(conversation = %conversation_id, "No reply generated");
            return Ok(());
        };

        let uuid = generate_uuid();
        let envelope = Envelope::chat_text(
            &OutboundText {
                conversation_id,
                receiver_id: &last.sender_id,
                text: &text,
                uuid: &uuid,
            },
            generate_mid(),
        );
        self.outbound.send(&envelope).await?;
        info!(conversation = %conversation_id, receiver = %last.sender_id, "Reply sent");
        Ok(())
    }
}
