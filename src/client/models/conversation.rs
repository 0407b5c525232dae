use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub role: Option<String>,
}

/// Denormalized preview of the most recent message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<MessagePreview>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_unmatched: bool,
    #[serde(default)]
    pub unmatched_by_other_user: bool,
    #[serde(default)]
    pub is_user_deleted: bool,
    #[serde(default)]
    pub is_admin_chat: bool,
}

/// Explanatory banner shown instead of the compose box when a
/// conversation is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationNotice {
    AccountDeleted,
    UnmatchedByOther,
    UnmatchedByYou,
}

impl Conversation {
    /// Match lifecycle gate: sends are possible only while the underlying
    /// match is mutual and the peer account still exists.
    pub fn can_send(&self) -> bool {
        !self.is_unmatched && !self.is_user_deleted
    }

    /// Account deletion wins over unmatch when both flags are set.
    pub fn notice(&self) -> Option<ConversationNotice> {
        if self.is_user_deleted {
            Some(ConversationNotice::AccountDeleted)
        } else if self.is_unmatched {
            if self.unmatched_by_other_user {
                Some(ConversationNotice::UnmatchedByOther)
            } else {
                Some(ConversationNotice::UnmatchedByYou)
            }
        } else {
            None
        }
    }

    pub fn other_participant(&self, me: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != me)
    }
}
