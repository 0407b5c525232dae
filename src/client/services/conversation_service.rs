use log::debug;

use crate::client::models::conversation::{Conversation, MessagePreview};
use crate::client::models::message::ChatMessage;
use crate::client::services::presence_service::PresenceTracker;

/// The current user's conversation list, in server order (most recent
/// activity first). The directory never re-sorts locally: order changes
/// only when a reload replaces the list, avoiding visual jitter.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with a fresh server snapshot. Server counts win
    /// over any stale local optimism.
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        debug!("[DIRECTORY] loaded {} conversations", conversations.len());
        self.conversations = conversations;
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn get_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == conversation_id)
    }

    /// Local optimistic unread adjustment (e.g. zeroing on open before the
    /// read-receipt round-trip lands). Clamped at zero.
    pub fn apply_unread_delta(&mut self, conversation_id: &str, delta: i64) {
        if let Some(conv) = self.get_mut(conversation_id) {
            let next = conv.unread_count as i64 + delta;
            conv.unread_count = next.max(0) as u32;
        }
    }

    /// Personal-queue push for a conversation that is not open: bump the
    /// unread count and refresh the preview. The periodic full reload
    /// remains the authority for these numbers.
    pub fn note_incoming(&mut self, message: &ChatMessage, active_conversation_id: Option<&str>) {
        let is_active = active_conversation_id == Some(message.conversation_id.as_str());
        if let Some(conv) = self.get_mut(&message.conversation_id) {
            if !is_active {
                conv.unread_count += 1;
            }
            conv.last_message = Some(MessagePreview {
                content: message.content.clone(),
                sent_at: message.sent_at,
            });
        }
    }

    /// Global badge value. Always recomputed from the full list, never
    /// incrementally tracked, so missed events cannot cause drift.
    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Presence decoration for one conversation: live set OR the REST
    /// participant flag, suppressed entirely once the relationship is
    /// severed (presence is meaningless for unmatched/deleted peers).
    pub fn has_online_user(
        conversation: &Conversation,
        presence: &PresenceTracker,
        me: &str,
    ) -> bool {
        if conversation.is_unmatched || conversation.is_user_deleted {
            return false;
        }
        match conversation.other_participant(me) {
            Some(other) => other.is_online || presence.is_online(&other.id),
            None => false,
        }
    }

    /// Online participant ids from a REST snapshot, used to seed the
    /// presence tracker on load.
    pub fn online_participant_ids(conversations: &[Conversation], me: &str) -> Vec<String> {
        conversations
            .iter()
            .flat_map(|c| c.participants.iter())
            .filter(|p| p.is_online && p.id != me)
            .map(|p| p.id.clone())
            .collect()
    }
}
