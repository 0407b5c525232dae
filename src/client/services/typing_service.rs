use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::services::websocket_client::{SessionTransport, APP_CHAT_TYPING};

/// Relays local keystrokes as typing broadcasts and debounces the stop
/// frame.
///
/// Every keystroke publishes `isTyping: true` (so a peer joining or
/// reconnecting mid-burst still learns the state) and re-arms the idle
/// timer; once the configured window passes with no input, exactly one
/// `isTyping: false` goes out. The emitting side owns the expiry, so
/// receivers never need their own timeout.
pub struct TypingCoordinator {
    transport: Arc<Mutex<SessionTransport>>,
    idle_after: Duration,
    pending: Option<PendingIdle>,
}

struct PendingIdle {
    conversation_id: String,
    timer: JoinHandle<()>,
}

impl TypingCoordinator {
    pub fn new(transport: Arc<Mutex<SessionTransport>>, idle_after: Duration) -> Self {
        Self {
            transport,
            idle_after,
            pending: None,
        }
    }

    /// Called on every local keystroke in the compose box. Typing frames are
    /// fire-and-forget: while disconnected the publish is skipped silently
    /// and no timer is armed.
    pub async fn on_local_input(&mut self, conversation_id: &str) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
            // a switch mid-burst closes the old conversation's burst first
            // so the peer's indicator does not stick
            if pending.conversation_id != conversation_id {
                self.transport
                    .lock()
                    .await
                    .publish(APP_CHAT_TYPING, typing_body(&pending.conversation_id, false));
            }
        }

        let published = self
            .transport
            .lock()
            .await
            .publish(APP_CHAT_TYPING, typing_body(conversation_id, true));
        if !published {
            debug!("[TYPING] keystroke broadcast skipped, transport offline");
            return;
        }

        let transport = Arc::clone(&self.transport);
        let conversation = conversation_id.to_string();
        let idle_after = self.idle_after;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle_after).await;
            transport
                .lock()
                .await
                .publish(APP_CHAT_TYPING, typing_body(&conversation, false));
        });
        self.pending = Some(PendingIdle {
            conversation_id: conversation_id.to_string(),
            timer,
        });
    }

    /// Cancel the idle timer and, if a burst was open, publish its
    /// `isTyping: false` immediately. Used on send, on conversation switch
    /// and at shutdown.
    pub async fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
            self.transport
                .lock()
                .await
                .publish(APP_CHAT_TYPING, typing_body(&pending.conversation_id, false));
        }
    }
}

fn typing_body(conversation_id: &str, is_typing: bool) -> serde_json::Value {
    json!({ "conversationId": conversation_id, "isTyping": is_typing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    async fn connected_transport() -> (
        Arc<Mutex<SessionTransport>>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let transport = Arc::new(Mutex::new(SessionTransport::new(&ClientConfig::default())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.lock().await.open_session(tx);
        // drain the connect-time presence announce
        while rx.try_recv().is_ok() {}
        (transport, rx)
    }

    fn typing_frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["destination"] == APP_CHAT_TYPING {
                    out.push(frame["body"].clone());
                }
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn every_keystroke_publishes_true_and_idle_emits_one_false() {
        let (transport, mut rx) = connected_transport().await;
        let mut typing = TypingCoordinator::new(Arc::clone(&transport), Duration::from_secs(2));

        // each keystroke broadcasts, so a peer reconnecting mid-burst
        // still learns the typing state
        typing.on_local_input("c1").await;
        // let the spawned idle timer register its deadline before the
        // paused clock advances
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        typing.on_local_input("c1").await;
        tokio::task::yield_now().await;
        let frames = typing_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f["isTyping"] == true));

        // the idle window counts from the last keystroke
        tokio::time::advance(Duration::from_millis(1800)).await;
        tokio::task::yield_now().await;
        assert!(typing_frames(&mut rx).is_empty());

        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        let frames = typing_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["isTyping"], false);
        assert_eq!(frames[0]["conversationId"], "c1");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_the_burst_immediately() {
        let (transport, mut rx) = connected_transport().await;
        let mut typing = TypingCoordinator::new(Arc::clone(&transport), Duration::from_secs(2));

        typing.on_local_input("c1").await;
        typing_frames(&mut rx);

        typing.reset().await;
        let frames = typing_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["isTyping"], false);

        // the aborted timer must not fire a second false later
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(typing_frames(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_conversations_closes_the_old_burst() {
        let (transport, mut rx) = connected_transport().await;
        let mut typing = TypingCoordinator::new(Arc::clone(&transport), Duration::from_secs(2));

        typing.on_local_input("a").await;
        typing_frames(&mut rx);

        typing.on_local_input("b").await;
        let frames = typing_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["conversationId"], "a");
        assert_eq!(frames[0]["isTyping"], false);
        assert_eq!(frames[1]["conversationId"], "b");
        assert_eq!(frames[1]["isTyping"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_input_is_silently_dropped() {
        let transport = Arc::new(Mutex::new(SessionTransport::new(&ClientConfig::default())));
        let mut typing = TypingCoordinator::new(Arc::clone(&transport), Duration::from_secs(2));

        typing.on_local_input("c1").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        // no timer armed, so nothing to flush on reset either
        typing.reset().await;
    }
}
