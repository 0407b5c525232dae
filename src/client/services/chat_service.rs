use std::collections::HashMap;

use log::{debug, warn};

use crate::client::models::events::{DeliveryUpdate, TypingEvent};
use crate::client::models::message::ChatMessage;
use crate::client::services::conversation_service::ConversationDirectory;
use crate::client::services::presence_service::PresenceTracker;

/// What happened to a real-time push when merged into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Echo of the current user's own send; the REST-confirmed copy is
    /// already in the log, so the echo is discarded.
    OwnEcho,
    /// Same server identifier already present.
    Duplicate,
    /// Event tagged for a conversation that is not open (late arrival
    /// after a switch).
    Inactive,
    /// New peer message appended; caller should mark the conversation read.
    Appended,
}

/// The per-conversation ordered message log, open at most one at a time.
#[derive(Debug)]
pub struct ActiveConversation {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
}

/// Session-scoped chat state root: conversation directory, presence set,
/// remote typing map, the open conversation's log and the compose buffer.
///
/// All mutation happens through the `apply_*` transitions below; they are
/// synchronous and single-writer (the session event loop), which keeps the
/// three-way merge of send confirmations, real-time pushes and delivery
/// events centrally testable.
pub struct ChatService {
    me: String,
    pub directory: ConversationDirectory,
    pub presence: PresenceTracker,
    typing_users: HashMap<String, Option<String>>,
    active: Option<ActiveConversation>,
    compose: String,
}

impl ChatService {
    pub fn new(me: &str) -> Self {
        Self {
            me: me.to_string(),
            directory: ConversationDirectory::new(),
            presence: PresenceTracker::new(),
            typing_users: HashMap::new(),
            active: None,
            compose: String::new(),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.conversation_id.as_str())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.active.as_ref().map(|a| a.messages.as_slice()).unwrap_or(&[])
    }

    /// Gate check for the send path, derived from the conversation's
    /// relationship flags. Unknown conversations cannot be sent into.
    pub fn can_send(&self, conversation_id: &str) -> bool {
        self.directory
            .get(conversation_id)
            .map(|c| c.can_send())
            .unwrap_or(false)
    }

    /// Install a freshly fetched history page. The server returns
    /// newest-first; the log is kept oldest-first for display.
    pub fn set_history(&mut self, conversation_id: &str, newest_first: Vec<ChatMessage>) {
        let mut messages = newest_first;
        messages.reverse();
        self.active = Some(ActiveConversation {
            conversation_id: conversation_id.to_string(),
            messages,
        });
    }

    pub fn close_active(&mut self) {
        self.active = None;
        // a dropped "stopped typing" frame must not stick across navigation
        self.typing_users.clear();
    }

    /// Append the REST-confirmed copy of the current user's own send.
    pub fn apply_own_confirmed(&mut self, message: ChatMessage) {
        match &mut self.active {
            Some(active) if active.conversation_id == message.conversation_id => {
                insert_ordered(&mut active.messages, message);
            }
            _ => debug!("[CHAT] confirmed send for inactive conversation {}", message.conversation_id),
        }
    }

    /// Merge a real-time push from the conversation topic. Own echoes and
    /// duplicate identifiers are discarded; everything else is appended in
    /// `sentAt` order.
    pub fn apply_remote_push(&mut self, message: ChatMessage) -> PushOutcome {
        if message.sender_id == self.me {
            return PushOutcome::OwnEcho;
        }
        let active = match &mut self.active {
            Some(active) if active.conversation_id == message.conversation_id => active,
            _ => return PushOutcome::Inactive,
        };
        if active.messages.iter().any(|m| m.id == message.id) {
            return PushOutcome::Duplicate;
        }
        insert_ordered(&mut active.messages, message);
        PushOutcome::Appended
    }

    /// Apply an asynchronous delivery confirmation. Only the open
    /// conversation's log is updated, and never backwards: a redelivered
    /// stale event leaves the message at its later status.
    pub fn apply_delivery_update(&mut self, update: &DeliveryUpdate) -> bool {
        let active = match &mut self.active {
            Some(active) if active.conversation_id == update.conversation_id => active,
            _ => return false,
        };
        match active.messages.iter_mut().find(|m| m.id == update.message_id) {
            Some(message) => message.advance_status(update.status, update.delivered_at),
            None => {
                warn!("[CHAT] delivery update for unknown message {}", update.message_id);
                false
            }
        }
    }

    /// Remote typing state, keyed by conversation. The emitting peer owns
    /// its own expiry (it sends `isTyping: false` after going idle).
    pub fn apply_typing_event(&mut self, event: &TypingEvent) {
        let user = if event.is_typing { event.user_id.clone() } else { None };
        self.typing_users.insert(event.conversation_id.clone(), user);
    }

    /// Who is typing in a conversation, suppressed once the relationship
    /// is severed.
    pub fn typing_user(&self, conversation_id: &str) -> Option<&str> {
        if let Some(conv) = self.directory.get(conversation_id) {
            if conv.is_unmatched || conv.is_user_deleted {
                return None;
            }
        }
        self.typing_users
            .get(conversation_id)
            .and_then(|u| u.as_deref())
    }

    // Compose buffer: cleared optimistically at send time, restored on
    // REST failure so the user can retry.

    pub fn input(&self) -> &str {
        &self.compose
    }

    pub fn set_input(&mut self, content: &str) {
        self.compose = content.to_string();
    }

    pub fn take_input(&mut self) -> String {
        std::mem::take(&mut self.compose)
    }

    pub fn restore_input(&mut self, content: String) {
        self.compose = content;
    }
}

/// Keep the log non-decreasing in `sentAt`. Live pushes are effectively
/// always-newest so this is an append in practice, but a concurrent
/// out-of-order arrival must not break the ordering invariant.
fn insert_ordered(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    let position = messages
        .iter()
        .rposition(|m| m.sent_at <= message.sent_at)
        .map(|i| i + 1)
        .unwrap_or(0);
    messages.insert(position, message);
}
