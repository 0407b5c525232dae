use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::models::message::DeliveryStatus;

/// Typing indicator event, both directions. Outbound frames omit `userId`
/// (the server stamps the sender); inbound frames carry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    pub online: bool,
}

/// Asynchronous delivery confirmation, keyed by server message identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdate {
    pub conversation_id: String,
    pub message_id: String,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Entry from the personal notification queue. Consumed and counted only;
/// rendering notifications is outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
