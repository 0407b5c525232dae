use std::collections::HashSet;

use log::debug;

use crate::client::models::events::PresenceEvent;

/// Best-effort set of currently-online user ids, merged from the live
/// presence topic and one-shot REST snapshots. Never authoritative for
/// whether messaging is possible; UI decoration only.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additive merge from a conversation-list snapshot. A stale snapshot
    /// must never mark someone offline, so this never removes entries.
    pub fn seed<I>(&mut self, user_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        for id in user_ids {
            self.online.insert(id);
        }
    }

    /// Live toggle from the presence broadcast topic.
    pub fn apply(&mut self, event: &PresenceEvent) {
        if event.online {
            self.online.insert(event.user_id.clone());
        } else {
            self.online.remove(&event.user_id);
        }
        debug!("[PRESENCE] {} online={}", event.user_id, event.online);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toggle(user_id: &str, online: bool) -> PresenceEvent {
        PresenceEvent { user_id: user_id.to_string(), online }
    }

    #[test]
    fn seeding_is_additive_only() {
        let mut tracker = PresenceTracker::new();
        tracker.apply(&toggle("u1", true));
        // a stale snapshot that omits u1 must not knock it offline
        tracker.seed(vec!["u2".to_string()]);
        assert!(tracker.is_online("u1"));
        assert!(tracker.is_online("u2"));
    }

    #[test]
    fn toggles_set_and_clear_membership() {
        let mut tracker = PresenceTracker::new();
        tracker.apply(&toggle("u1", true));
        assert!(tracker.is_online("u1"));
        tracker.apply(&toggle("u1", false));
        assert!(!tracker.is_online("u1"));
        assert_eq!(tracker.online_count(), 0);
    }
}
