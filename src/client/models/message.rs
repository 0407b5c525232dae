use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-message delivery lifecycle. The derived `Ord` is the monotonic
/// ordering used by the regression guard: a message never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        DeliveryStatus::Sent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_role: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Apply a status update, refusing regressions. Returns whether the
    /// message changed. A redelivered stale event (e.g. SENT after
    /// DELIVERED) is a no-op.
    pub fn advance_status(
        &mut self,
        status: DeliveryStatus,
        delivered_at: Option<DateTime<Utc>>,
    ) -> bool {
        if status <= self.status {
            return false;
        }
        self.status = status;
        if status == DeliveryStatus::Read {
            self.is_read = true;
        }
        if let Some(at) = delivered_at {
            self.delivered_at = Some(at);
        }
        true
    }
}

/// Display derivation: show the peer avatar only on the first message of a
/// consecutive run from the same sender. Pure function over (msg, prev).
pub fn show_avatar(message: &ChatMessage, previous: Option<&ChatMessage>, me: &str) -> bool {
    if message.sender_id == me {
        return false;
    }
    match previous {
        Some(prev) => prev.sender_id != message.sender_id,
        None => true,
    }
}

/// Display derivation: show a timestamp when the sender changes or after
/// more than five minutes of silence.
pub fn show_timestamp(message: &ChatMessage, previous: Option<&ChatMessage>) -> bool {
    match previous {
        Some(prev) => {
            prev.sender_id != message.sender_id
                || message.sent_at - prev.sent_at > Duration::minutes(5)
        }
        None => true,
    }
}
