use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::client::models::conversation::Conversation;
use crate::client::models::events::{DeliveryUpdate, Notification, PresenceEvent, TypingEvent};
use crate::client::models::message::ChatMessage;
use crate::client::services::api_client::{ApiClient, AuthTokens};
use crate::client::services::chat_service::{ChatService, PushOutcome};
use crate::client::services::conversation_service::ConversationDirectory;
use crate::client::services::typing_service::TypingCoordinator;
use crate::client::services::websocket_client::{
    self, conversation_topic, user_queue, SessionTransport, APP_CHAT_SEND, PRESENCE_TOPIC,
};
use crate::config::ClientConfig;

/// Result of a send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Refused locally (severed conversation or empty input); no I/O done.
    Blocked,
    /// Durably accepted by the server; the echo publish is best-effort.
    Sent,
    /// REST path failed; the draft was restored to the compose buffer.
    Failed(String),
}

/// One authenticated chat session: owns the transport, the REST client, the
/// chat state root and every background pump wired between them.
///
/// Lifecycle: `start` brings everything up, `open_conversation` moves the
/// single active topic subscription, `shutdown` tears it all down. Dropping
/// the session without `shutdown` leaks the spawned pumps until the runtime
/// exits, so callers should shut down explicitly.
pub struct ClientSession {
    config: ClientConfig,
    api: ApiClient,
    transport: Arc<Mutex<SessionTransport>>,
    chat: Arc<Mutex<ChatService>>,
    typing: TypingCoordinator,
    user_id: String,
    pumps: Vec<JoinHandle<()>>,
    topic_pump: Option<JoinHandle<()>>,
    refresh_tick: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Authenticate, connect the transport, register the personal queues and
    /// load the conversation directory.
    pub async fn start(config: ClientConfig, tokens: AuthTokens) -> anyhow::Result<Self> {
        let api = ApiClient::new(&config.api_base_url, tokens);
        let me = api.get_me().await?;
        info!("[SESSION] starting for user {}", me.id);

        let transport = Arc::new(Mutex::new(SessionTransport::new(&config)));
        let chat = Arc::new(Mutex::new(ChatService::new(&me.id)));

        // Register everything before connecting: the registry survives in the
        // transport and the subscribe frames go out at session open.
        let (messages_rx, typing_rx, notifications_rx, delivery_rx, presence_rx) = {
            let mut guard = transport.lock().await;
            guard.set_token(Some(api.access_token().await));
            (
                guard.subscribe(&user_queue(&me.id, "messages")),
                guard.subscribe(&user_queue(&me.id, "typing")),
                guard.subscribe(&user_queue(&me.id, "notifications")),
                guard.subscribe(&user_queue(&me.id, "delivery")),
                guard.subscribe(PRESENCE_TOPIC),
            )
        };
        websocket_client::connect(Arc::clone(&transport)).await?;

        let mut session = Self {
            typing: TypingCoordinator::new(
                Arc::clone(&transport),
                Duration::from_millis(config.typing_idle_ms),
            ),
            config,
            api,
            transport,
            chat,
            user_id: me.id,
            pumps: Vec::new(),
            topic_pump: None,
            refresh_tick: None,
        };

        session.spawn_personal_pumps(messages_rx, typing_rx, notifications_rx, delivery_rx, presence_rx);
        session.reload_directory().await?;
        session.spawn_refresh_tick();
        Ok(session)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn chat(&self) -> Arc<Mutex<ChatService>> {
        Arc::clone(&self.chat)
    }

    fn spawn_personal_pumps(
        &mut self,
        mut messages_rx: mpsc::UnboundedReceiver<Value>,
        mut typing_rx: mpsc::UnboundedReceiver<Value>,
        mut notifications_rx: mpsc::UnboundedReceiver<Value>,
        mut delivery_rx: mpsc::UnboundedReceiver<Value>,
        mut presence_rx: mpsc::UnboundedReceiver<Value>,
    ) {
        // Personal message queue: directory bookkeeping only. The open
        // conversation's log is fed by its topic subscription.
        let chat = Arc::clone(&self.chat);
        self.pumps.push(tokio::spawn(async move {
            while let Some(body) = messages_rx.recv().await {
                if let Some(message) = decode_event::<ChatMessage>("messages", body) {
                    let mut chat = chat.lock().await;
                    let active = chat.active_conversation_id().map(str::to_string);
                    chat.directory.note_incoming(&message, active.as_deref());
                }
            }
        }));

        let chat = Arc::clone(&self.chat);
        self.pumps.push(tokio::spawn(async move {
            while let Some(body) = typing_rx.recv().await {
                if let Some(event) = decode_event::<TypingEvent>("typing", body) {
                    chat.lock().await.apply_typing_event(&event);
                }
            }
        }));

        self.pumps.push(tokio::spawn(async move {
            while let Some(body) = notifications_rx.recv().await {
                if let Some(notification) = decode_event::<Notification>("notifications", body) {
                    info!(
                        "[SESSION] notification {} ({})",
                        notification.id,
                        notification.kind.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }));

        let chat = Arc::clone(&self.chat);
        self.pumps.push(tokio::spawn(async move {
            while let Some(body) = delivery_rx.recv().await {
                if let Some(update) = decode_event::<DeliveryUpdate>("delivery", body) {
                    chat.lock().await.apply_delivery_update(&update);
                }
            }
        }));

        let chat = Arc::clone(&self.chat);
        self.pumps.push(tokio::spawn(async move {
            while let Some(body) = presence_rx.recv().await {
                if let Some(event) = decode_event::<PresenceEvent>("presence", body) {
                    chat.lock().await.presence.apply(&event);
                }
            }
        }));
    }

    fn spawn_refresh_tick(&mut self) {
        let api = self.api.clone();
        let chat = Arc::clone(&self.chat);
        let period = Duration::from_secs(self.config.directory_refresh_secs);
        self.refresh_tick = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick, directory already loaded
            loop {
                tick.tick().await;
                match api.get_conversations().await {
                    Ok(conversations) => apply_directory(&chat, conversations).await,
                    Err(e) => warn!("[SESSION] directory refresh failed: {}", e),
                }
            }
        }));
    }

    /// Fetch the conversation list and replace local state with it. Server
    /// counts win over any optimistic unread adjustments.
    pub async fn reload_directory(&self) -> anyhow::Result<()> {
        let conversations = self.api.get_conversations().await?;
        apply_directory(&self.chat, conversations).await;
        Ok(())
    }

    /// Switch the active conversation. The old topic is dropped before the
    /// new one is attached, so a late event for the old conversation can
    /// never land in the new log.
    pub async fn open_conversation(&mut self, conversation_id: &str) -> anyhow::Result<()> {
        self.typing.reset().await;
        if let Some(pump) = self.topic_pump.take() {
            pump.abort();
        }
        {
            let mut chat = self.chat.lock().await;
            if let Some(previous) = chat.active_conversation_id().map(str::to_string) {
                self.transport.lock().await.unsubscribe(&conversation_topic(&previous));
            }
            chat.close_active();
        }

        let topic_rx = self
            .transport
            .lock()
            .await
            .subscribe(&conversation_topic(conversation_id));

        let history = self.api.get_messages(conversation_id, 0).await?;
        {
            let mut chat = self.chat.lock().await;
            chat.set_history(conversation_id, history);
            let unread = chat
                .directory
                .get(conversation_id)
                .map(|c| c.unread_count)
                .unwrap_or(0);
            chat.directory.apply_unread_delta(conversation_id, -(unread as i64));
        }

        // Delivered before read: the sender sees the two-step progression.
        // Receipts are idempotent state advances; a transient failure must
        // not abort an otherwise-open conversation.
        if let Err(e) = self.api.mark_as_delivered(conversation_id).await {
            warn!("[SESSION] delivered receipt failed: {}", e);
        }
        if let Err(e) = self.api.mark_as_read(conversation_id).await {
            warn!("[SESSION] read receipt failed: {}", e);
        }

        self.topic_pump = Some(spawn_topic_pump(
            Arc::clone(&self.chat),
            self.api.clone(),
            conversation_id.to_string(),
            topic_rx,
        ));
        info!("[SESSION] opened conversation {}", conversation_id);
        Ok(())
    }

    /// Send the compose buffer into the active conversation. The REST call
    /// is the durable path; the topic publish afterwards is a best-effort
    /// latency optimization and its failure is not an error.
    pub async fn send_message(&mut self, conversation_id: &str) -> SendOutcome {
        let draft = {
            let mut chat = self.chat.lock().await;
            if !chat.can_send(conversation_id) {
                debug!("[SESSION] send blocked for {}", conversation_id);
                return SendOutcome::Blocked;
            }
            // a whitespace-only draft is left in place, not consumed
            if chat.input().trim().is_empty() {
                return SendOutcome::Blocked;
            }
            chat.take_input()
        };
        self.typing.reset().await;

        match self.api.send_message(conversation_id, &draft).await {
            Ok(confirmed) => {
                let echo = serde_json::to_value(&confirmed).unwrap_or(Value::Null);
                {
                    let mut chat = self.chat.lock().await;
                    chat.directory.note_incoming(&confirmed, Some(conversation_id));
                    chat.apply_own_confirmed(confirmed);
                }
                if !self.transport.lock().await.publish(APP_CHAT_SEND, echo) {
                    debug!("[SESSION] echo publish skipped, transport offline");
                }
                SendOutcome::Sent
            }
            Err(e) => {
                warn!("[SESSION] send failed: {}", e);
                self.chat.lock().await.restore_input(draft);
                SendOutcome::Failed(e.to_string())
            }
        }
    }

    /// Sever the match with a user. No optimistic local update: the
    /// directory is reloaded only after the server confirms, and the
    /// refreshed flags freeze the affected conversation.
    pub async fn remove_match(&self, user_id: &str, delete_chat: bool) -> anyhow::Result<()> {
        self.api.remove_match(user_id, delete_chat).await?;
        self.reload_directory().await?;
        info!("[SESSION] match with {} removed (delete_chat={})", user_id, delete_chat);
        Ok(())
    }

    pub async fn start_conversation(&self, participant_id: &str) -> anyhow::Result<Conversation> {
        let conversation = self
            .api
            .create_conversation(&[self.user_id.clone(), participant_id.to_string()])
            .await?;
        self.reload_directory().await?;
        Ok(conversation)
    }

    /// Record a keystroke in the compose buffer and drive the typing
    /// broadcast debounce. Frozen conversations keep the draft but never
    /// broadcast typing.
    pub async fn on_input_change(&mut self, conversation_id: &str, content: &str) {
        let can_send = {
            let mut chat = self.chat.lock().await;
            chat.set_input(content);
            chat.can_send(conversation_id)
        };
        if can_send {
            self.typing.on_local_input(conversation_id).await;
        } else {
            debug!("[SESSION] typing broadcast suppressed for {}", conversation_id);
        }
    }

    /// Orderly teardown: stop pumps, close the typing burst, announce
    /// offline and stop the reconnect driver.
    pub async fn shutdown(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        if let Some(pump) = self.topic_pump.take() {
            pump.abort();
        }
        if let Some(tick) = self.refresh_tick.take() {
            tick.abort();
        }
        self.typing.reset().await;
        let mut transport = self.transport.lock().await;
        transport.disconnect();
        transport.set_token(None);
        info!("[SESSION] shut down");
    }
}

async fn apply_directory(chat: &Arc<Mutex<ChatService>>, conversations: Vec<Conversation>) {
    let mut chat = chat.lock().await;
    let me = chat.me().to_string();
    let online = ConversationDirectory::online_participant_ids(&conversations, &me);
    chat.directory.set_conversations(conversations);
    chat.presence.seed(online);
}

/// Pump for the active conversation's topic: merges pushes into the log and
/// acknowledges peer messages that arrive while the conversation is open.
fn spawn_topic_pump(
    chat: Arc<Mutex<ChatService>>,
    api: ApiClient,
    conversation_id: String,
    mut topic_rx: mpsc::UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(body) = topic_rx.recv().await {
            let message = match decode_event::<ChatMessage>("topic", body) {
                Some(message) => message,
                None => continue,
            };
            let outcome = chat.lock().await.apply_remote_push(message);
            if outcome == PushOutcome::Appended {
                // the conversation is on screen, so acknowledge immediately
                if let Err(e) = api.mark_as_read(&conversation_id).await {
                    warn!("[SESSION] read receipt failed: {}", e);
                }
            }
        }
    })
}

fn decode_event<T: serde::de::DeserializeOwned>(queue: &str, body: Value) -> Option<T> {
    match serde_json::from_value(body) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("[SESSION] malformed {} event: {}", queue, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::models::conversation::Participant;
    use crate::client::services::websocket_client::APP_CHAT_TYPING;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            participants: vec![
                Participant { id: "me".to_string(), display_name: "Me".to_string(), is_online: false, role: None },
                Participant { id: "peer".to_string(), display_name: "Peer".to_string(), is_online: false, role: None },
            ],
            last_message: None,
            unread_count: 0,
            is_unmatched: false,
            unmatched_by_other_user: false,
            is_user_deleted: false,
            is_admin_chat: false,
        }
    }

    fn test_config(api_base_url: &str) -> ClientConfig {
        ClientConfig {
            api_base_url: api_base_url.to_string(),
            ws_url: "ws://127.0.0.1:9/ws".to_string(),
            reconnect_delay_ms: 5000,
            heartbeat_interval_ms: 4000,
            max_missed_heartbeats: 2,
            typing_idle_ms: 2000,
            directory_refresh_secs: 30,
        }
    }

    fn test_session(api_base_url: &str) -> ClientSession {
        let config = test_config(api_base_url);
        let transport = Arc::new(Mutex::new(SessionTransport::new(&config)));
        ClientSession {
            api: ApiClient::new(&config.api_base_url, AuthTokens::default()),
            typing: TypingCoordinator::new(
                Arc::clone(&transport),
                Duration::from_millis(config.typing_idle_ms),
            ),
            transport,
            chat: Arc::new(Mutex::new(ChatService::new("me"))),
            user_id: "me".to_string(),
            pumps: Vec::new(),
            topic_pump: None,
            refresh_tick: None,
            config,
        }
    }

    /// Minimal one-request-per-connection HTTP responder. Routes are
    /// `(path_prefix, status, body)`; every request line is recorded so
    /// tests can assert call ordering.
    async fn spawn_stub(
        routes: Vec<(&'static str, u16, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break None,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                                break Some(pos + 4);
                            }
                        }
                    }
                };
                let header_end = match header_end {
                    Some(end) => end,
                    None => continue,
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request_line = head.lines().next().unwrap_or("").to_string();
                log.lock().await.push(request_line.clone());
                let path = request_line.split_whitespace().nth(1).unwrap_or("");
                let (status, body) = routes
                    .iter()
                    .find(|(prefix, _, _)| path.starts_with(prefix))
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, "{}"));
                let response = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (base, seen)
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

    #[test]
    fn malformed_queue_events_are_dropped() {
        let event = decode_event::<PresenceEvent>("presence", json!({ "online": true }));
        assert!(event.is_none());

        let event = decode_event::<PresenceEvent>(
            "presence",
            json!({ "userId": "u1", "online": true }),
        );
        assert_eq!(event.unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn directory_snapshot_seeds_presence() {
        let chat = Arc::new(Mutex::new(ChatService::new("me")));
        let mut c = conv("c1");
        c.unread_count = 2;
        c.participants[0].is_online = true;
        c.participants[1].is_online = true;
        apply_directory(&chat, vec![c]).await;

        let chat = chat.lock().await;
        assert_eq!(chat.directory.total_unread(), 2);
        assert!(chat.presence.is_online("peer"));
        assert!(!chat.presence.is_online("me"));
    }

    #[tokio::test]
    async fn opening_marks_delivered_before_read() {
        let (base, seen) = spawn_stub(vec![
            ("/api/conversations/c1/messages", 200, r#"{"content":[]}"#),
            ("/api/conversations/c1/delivered", 200, "{}"),
            ("/api/conversations/c1/read", 200, "{}"),
        ])
        .await;
        let mut session = test_session(&base);
        session.chat.lock().await.directory.set_conversations(vec![conv("c1")]);

        session.open_conversation("c1").await.unwrap();

        let seen = seen.lock().await;
        let paths: Vec<&str> = seen
            .iter()
            .map(|line| line.split_whitespace().nth(1).unwrap())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/api/conversations/c1/messages?page=0",
                "/api/conversations/c1/delivered",
                "/api/conversations/c1/read",
            ]
        );
        assert!(session.topic_pump.is_some());
    }

    #[tokio::test]
    async fn receipt_failure_keeps_the_conversation_open() {
        let (base, seen) = spawn_stub(vec![
            ("/api/conversations/c1/messages", 200, r#"{"content":[]}"#),
            ("/api/conversations/c1/delivered", 500, "{}"),
            ("/api/conversations/c1/read", 200, "{}"),
        ])
        .await;
        let mut session = test_session(&base);
        session.chat.lock().await.directory.set_conversations(vec![conv("c1")]);

        session.open_conversation("c1").await.unwrap();

        assert!(session.topic_pump.is_some());
        assert_eq!(
            session.chat.lock().await.active_conversation_id(),
            Some("c1")
        );
        // read is still attempted after the failed delivered call
        let seen = seen.lock().await;
        assert!(seen.iter().any(|l| l.contains("/api/conversations/c1/read")));
    }

    #[tokio::test]
    async fn failed_send_restores_the_draft() {
        let (base, _seen) =
            spawn_stub(vec![("/api/conversations/c1/messages", 500, "{}")]).await;
        let mut session = test_session(&base);
        {
            let mut chat = session.chat.lock().await;
            chat.directory.set_conversations(vec![conv("c1")]);
            chat.set_input("hello there");
        }

        let outcome = session.send_message("c1").await;
        assert!(matches!(outcome, SendOutcome::Failed(_)));
        assert_eq!(session.chat.lock().await.input(), "hello there");
    }

    #[tokio::test]
    async fn whitespace_draft_is_blocked_without_io() {
        // unroutable base: any request would fail loudly, not block
        let mut session = test_session("http://127.0.0.1:9");
        {
            let mut chat = session.chat.lock().await;
            chat.directory.set_conversations(vec![conv("c1")]);
            chat.set_input("   ");
        }

        assert_eq!(session.send_message("c1").await, SendOutcome::Blocked);
        assert_eq!(session.chat.lock().await.input(), "   ");
    }

    #[tokio::test]
    async fn typing_broadcast_is_gated_by_match_state() {
        let mut session = test_session("http://127.0.0.1:9");
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.transport.lock().await.open_session(tx);
        while rx.try_recv().is_ok() {}

        let mut frozen = conv("c1");
        frozen.is_unmatched = true;
        session.chat.lock().await.directory.set_conversations(vec![frozen]);

        session.on_input_change("c1", "hey").await;
        assert!(typing_frames(&mut rx).is_empty());
        // the draft is still recorded for the disabled compose box
        assert_eq!(session.chat.lock().await.input(), "hey");

        session
            .chat
            .lock()
            .await
            .directory
            .get_mut("c1")
            .unwrap()
            .is_unmatched = false;
        session.on_input_change("c1", "hey again").await;
        let frames = typing_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["isTyping"], true);
    }
}
