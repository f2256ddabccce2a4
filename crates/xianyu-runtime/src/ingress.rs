//! Payload routing for inbound frames
//!
//! Frames that survived ack handling are decoded by the envelope codec and
//! classified. Buyer chat messages go to the batcher; seller messages control
//! manual mode; everything else is logged and dropped.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use xianyu_core::{
    classify, now_millis, ChatMessage, Envelope, EnvelopeCodec, InboundKind, OrderStatus,
};

use crate::batcher::{AddOutcome, ConversationBatcher};
use crate::manual::{is_toggle_keyword, ConversationMode, ManualModeRegistry};

/// What happened to a routed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The codec does not apply to this frame
    NotApplicable,
    /// The payload could not be decoded
    DecodeFailed,
    Order { status: OrderStatus, user_id: String },
    /// Typing indicators and other non-chat pushes
    Ignored,
    /// Chat payload missing a routable field
    Malformed,
    Expired,
    /// The seller toggled manual mode for a conversation
    ModeToggled(ConversationMode),
    /// The seller replied by hand
    SellerReply,
    Batched(AddOutcome),
}

pub struct FrameIngress {
    account_id: String,
    codec: Arc<dyn EnvelopeCodec>,
    batcher: ConversationBatcher<ChatMessage>,
    manual: Arc<ManualModeRegistry>,
    toggle_keywords: String,
    expire_time_ms: u64,
}

impl FrameIngress {
    pub fn new(
        account_id: impl Into<String>,
        codec: Arc<dyn EnvelopeCodec>,
        batcher: ConversationBatcher<ChatMessage>,
        manual: Arc<ManualModeRegistry>,
        toggle_keywords: impl Into<String>,
        expire_time_ms: u64,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            codec,
            batcher,
            manual,
            toggle_keywords: toggle_keywords.into(),
            expire_time_ms,
        }
    }

    pub async fn route(&self, envelope: &Envelope) -> RouteOutcome {
        let payload = match self.codec.decode(envelope) {
            Ok(Some(payload)) => payload,
            Ok(None) => return RouteOutcome::NotApplicable,
            Err(e) => {
                warn!("Failed to decode payload: {}", e);
                return RouteOutcome::DecodeFailed;
            }
        };

        match classify(&payload) {
            InboundKind::Order { status, user_id } => {
                info!(user = %user_id, ?status, "Order status changed");
                RouteOutcome::Order { status, user_id }
            }
            InboundKind::Typing => {
                debug!("Typing indicator");
                RouteOutcome::Ignored
            }
            InboundKind::Other => {
                debug!("Non-chat payload ignored");
                RouteOutcome::Ignored
            }
            InboundKind::Chat => self.route_chat(&payload).await,
        }
    }

    async fn route_chat(&self, payload: &Value) -> RouteOutcome {
        let message = match ChatMessage::extract(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping chat payload: {}", e);
                return RouteOutcome::Malformed;
            }
        };
        if message.is_expired(now_millis(), self.expire_time_ms) {
            debug!(conversation = %message.conversation_id, "Dropping expired message");
            return RouteOutcome::Expired;
        }

        if message.sender_id == self.account_id {
            if is_toggle_keyword(&self.toggle_keywords, &message.content) {
                let mode = self.manual.toggle(&message.conversation_id);
                return RouteOutcome::ModeToggled(mode);
            }
            info!(conversation = %message.conversation_id, "Seller replied manually");
            return RouteOutcome::SellerReply;
        }

        info!(
            conversation = %message.conversation_id,
            sender = %message.sender_name,
            item = %message.item_id,
            "Buyer message: {}",
            message.content
        );
        let conversation_id = message.conversation_id.clone();
        RouteOutcome::Batched(self.batcher.add(message, &conversation_id).await)
    }
}
