//! Inbound message classification
//!
//! Decoded payloads are numerically keyed JSON objects. This module tells
//! chat messages apart from typing indicators and order notices, and extracts
//! the fields the session layer routes on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ID_DOMAIN_SUFFIX;

// ----------------------------------------------------------------------------
// Classification
// ----------------------------------------------------------------------------

/// Order lifecycle notices pushed into the chat stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    AwaitingPayment,
    Closed,
    AwaitingShipment,
}

impl OrderStatus {
    fn from_reminder(reminder: &str) -> Option<Self> {
        match reminder {
            "等待买家付款" => Some(Self::AwaitingPayment),
            "交易关闭" => Some(Self::Closed),
            "等待卖家发货" => Some(Self::AwaitingShipment),
            _ => None,
        }
    }
}

/// What a decoded payload represents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// Order state change for a buyer
    Order { status: OrderStatus, user_id: String },
    /// Peer is typing
    Typing,
    /// Chat message from a buyer or from the seller account
    Chat,
    /// Anything else (read receipts, system pushes)
    Other,
}

/// Classify a decoded payload
pub fn classify(message: &Value) -> InboundKind {
    if let Some(order) = order_notice(message) {
        return order;
    }
    if is_typing(message) {
        return InboundKind::Typing;
    }
    if is_chat(message) {
        return InboundKind::Chat;
    }
    InboundKind::Other
}

fn order_notice(message: &Value) -> Option<InboundKind> {
    let reminder = message.get("3")?.get("redReminder")?.as_str()?;
    let status = OrderStatus::from_reminder(reminder)?;
    let user_id = strip_domain(message.get("1")?.as_str()?).to_string();
    Some(InboundKind::Order { status, user_id })
}

fn is_typing(message: &Value) -> bool {
    message
        .get("1")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|first| first.get("1"))
        .and_then(Value::as_str)
        .is_some_and(|id| id.contains(ID_DOMAIN_SUFFIX))
}

fn is_chat(message: &Value) -> bool {
    message
        .get("1")
        .filter(|inner| inner.is_object())
        .and_then(|inner| inner.get("10"))
        .filter(|meta| meta.is_object())
        .is_some_and(|meta| meta.get("reminderContent").is_some())
}

fn strip_domain(id: &str) -> &str {
    id.split('@').next().unwrap_or(id)
}

// ----------------------------------------------------------------------------
// Chat Message
// ----------------------------------------------------------------------------

/// Why a chat payload could not be turned into a [`ChatMessage`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("missing or malformed field {0}")]
    Malformed(&'static str),
    #[error("reminder url carries no item id")]
    MissingItem,
}

/// Routable fields of a chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Creation time in epoch milliseconds
    pub create_time: u64,
    pub sender_name: String,
    pub sender_id: String,
    pub content: String,
    pub item_id: String,
    pub conversation_id: String,
}

impl ChatMessage {
    /// Extract the routable fields of a chat payload
    pub fn extract(message: &Value) -> Result<Self, ExtractError> {
        let inner = message.get("1").ok_or(ExtractError::Malformed("1"))?;
        let meta = inner.get("10").ok_or(ExtractError::Malformed("1.10"))?;

        let create_time = match inner.get("5") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .ok_or(ExtractError::Malformed("1.5"))?;

        let text = |field: &'static str| {
            meta.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ExtractError::Malformed(field))
        };
        let sender_name = text("reminderTitle")?;
        let sender_id = text("senderUserId")?;
        let content = text("reminderContent")?;
        let url = text("reminderUrl")?;

        let conversation_id = inner
            .get("2")
            .and_then(Value::as_str)
            .map(|cid| strip_domain(cid).to_string())
            .ok_or(ExtractError::Malformed("1.2"))?;

        let item_id = item_id_from_url(&url).ok_or(ExtractError::MissingItem)?;

        Ok(Self {
            create_time,
            sender_name,
            sender_id,
            content,
            item_id,
            conversation_id,
        })
    }

    /// Whether the message is older than `expire_ms` at `now_ms`
    pub fn is_expired(&self, now_ms: u64, expire_ms: u64) -> bool {
        now_ms.saturating_sub(self.create_time) > expire_ms
    }
}

fn item_id_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("itemId=")?;
    let id = rest.split('&').next().unwrap_or_default();
    (!id.is_empty()).then(|| id.to_string())
}
