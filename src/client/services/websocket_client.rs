use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::ClientConfig;

/// Logical destinations, mirroring the server's channel topology.
pub const PRESENCE_TOPIC: &str = "/topic/presence";
pub const APP_PRESENCE: &str = "/app/presence";
pub const APP_CHAT_SEND: &str = "/app/chat.send";
pub const APP_CHAT_TYPING: &str = "/app/chat.typing";

pub fn conversation_topic(conversation_id: &str) -> String {
    format!("/topic/conversation/{}", conversation_id)
}

/// Per-user queues: `messages`, `typing`, `notifications`, `delivery`.
pub fn user_queue(user_id: &str, kind: &str) -> String {
    format!("/user/{}/queue/{}", user_id, kind)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    ConnectionFailed(String),
    AuthenticationFailed(String),
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            TransportError::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            TransportError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    pub message_type: String, // "auth"
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message_type: String, // "auth_response"
    pub success: bool,
    pub user_id: Option<String>,
    pub error: Option<String>,
}

// "subscribe" / "unsubscribe"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFrame {
    pub message_type: String,
    pub destination: String,
}

// "send" outbound, "event" inbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFrame {
    pub message_type: String,
    pub destination: String,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingFrame {
    pub message_type: String, // "ping" / "pong"
}

/// The single process-wide real-time connection. Constructed once per
/// authenticated session and borrowed (behind `Arc<Mutex<_>>`) by every
/// component that needs to publish or subscribe.
///
/// The subscription registry outlives individual socket connections:
/// subscribe frames are re-issued on every successful (re)connect, since
/// server-side subscriptions do not survive a connection loss.
pub struct SessionTransport {
    ws_url: String,
    token: Option<String>,
    state: ConnectionState,
    closing: bool,
    driver_running: bool,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<Value>>,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl SessionTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            token: None,
            state: ConnectionState::Disconnected,
            closing: false,
            driver_running: false,
            outgoing: None,
            subscriptions: HashMap::new(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            max_missed_heartbeats: config.max_missed_heartbeats,
        }
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Register interest in a destination. The returned receiver yields the
    /// `body` of every inbound event frame for that destination. The
    /// registry entry persists across reconnects until `unsubscribe`.
    pub fn subscribe(&mut self, destination: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(destination.to_string(), tx);
        if self.is_connected() {
            self.send_control("subscribe", destination);
        }
        debug!("[WS] subscribed to {}", destination);
        rx
    }

    /// Drop a destination. Late events still in flight for it are discarded
    /// at dispatch, so they cannot be misapplied after a conversation switch.
    pub fn unsubscribe(&mut self, destination: &str) {
        if self.subscriptions.remove(destination).is_some() {
            if self.is_connected() {
                self.send_control("unsubscribe", destination);
            }
            debug!("[WS] unsubscribed from {}", destination);
        }
    }

    /// Fire-and-forget publish. Returns `false` while not connected; the
    /// caller treats that as a recoverable condition (chat sends have the
    /// REST path as the durable fallback, typing is inherently lossy).
    pub fn publish(&mut self, destination: &str, body: Value) -> bool {
        if !self.is_connected() {
            debug!("[WS] publish to {} skipped, not connected", destination);
            return false;
        }
        let frame = DataFrame {
            message_type: "send".to_string(),
            destination: destination.to_string(),
            body,
        };
        match serde_json::to_string(&frame) {
            Ok(json) => self.send_raw(json),
            Err(e) => {
                warn!("[WS] failed to serialize publish for {}: {}", destination, e);
                false
            }
        }
    }

    /// Best-effort offline announce, then teardown. Safe to call at any
    /// time, including when never connected.
    pub fn disconnect(&mut self) {
        self.closing = true;
        if self.is_connected() {
            self.publish(APP_PRESENCE, serde_json::json!({ "online": false }));
            if let Some(tx) = &self.outgoing {
                let _ = tx.send(Message::Close(None));
            }
        }
        self.outgoing = None;
        self.state = ConnectionState::Disconnected;
        info!("[WS] disconnected");
    }

    fn send_control(&mut self, message_type: &str, destination: &str) {
        let frame = ControlFrame {
            message_type: message_type.to_string(),
            destination: destination.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&frame) {
            self.send_raw(json);
        }
    }

    fn send_raw(&mut self, json: String) -> bool {
        match &self.outgoing {
            Some(tx) => {
                if tx.send(Message::Text(json)).is_err() {
                    warn!("[WS] outgoing channel closed, marking connection lost");
                    self.connection_lost();
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Route an inbound event frame to its subscriber. Unknown destinations
    /// are dropped; a dead subscriber is pruned without affecting the rest.
    pub(crate) fn dispatch(&mut self, destination: &str, body: Value) {
        match self.subscriptions.get(destination) {
            Some(tx) => {
                if tx.send(body).is_err() {
                    debug!("[WS] subscriber for {} gone, pruning", destination);
                    self.subscriptions.remove(destination);
                }
            }
            None => debug!("[WS] event for unsubscribed destination {}", destination),
        }
    }

    /// Called once per successful connect+handshake: re-issues every
    /// registered subscription and announces presence.
    pub(crate) fn open_session(&mut self, outgoing: mpsc::UnboundedSender<Message>) {
        self.outgoing = Some(outgoing);
        self.state = ConnectionState::Connected;
        let destinations: Vec<String> = self.subscriptions.keys().cloned().collect();
        for destination in destinations {
            self.send_control("subscribe", &destination);
        }
        self.publish(APP_PRESENCE, serde_json::json!({ "online": true }));
        info!("[WS] session open, {} subscriptions issued", self.subscriptions.len());
    }

    pub(crate) fn connection_lost(&mut self) {
        self.outgoing = None;
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
    }
}

/// Idempotent connect: spawns the connection driver if it is not already
/// running. Transport failures never surface here; they are logged and
/// retried on a fixed delay while the session token remains set.
pub async fn connect(transport: Arc<Mutex<SessionTransport>>) -> anyhow::Result<()> {
    {
        let mut guard = transport.lock().await;
        if guard.driver_running {
            return Ok(());
        }
        if guard.token.is_none() {
            return Err(TransportError::AuthenticationFailed("no session token".to_string()).into());
        }
        url::Url::parse(&guard.ws_url)
            .map_err(|e| TransportError::ConnectionFailed(format!("bad ws url: {}", e)))?;
        guard.driver_running = true;
        guard.closing = false;
        guard.state = ConnectionState::Connecting;
    }
    tokio::spawn(run_driver(transport));
    Ok(())
}

async fn run_driver(transport: Arc<Mutex<SessionTransport>>) {
    loop {
        let (url, token, delay) = {
            let guard = transport.lock().await;
            if guard.closing || guard.token.is_none() {
                break;
            }
            (
                guard.ws_url.clone(),
                guard.token.clone().unwrap_or_default(),
                guard.reconnect_delay,
            )
        };

        match run_connection(&transport, &url, &token).await {
            Ok(()) => info!("[WS] connection closed"),
            Err(e) => warn!("[WS] connection error: {}", e),
        }

        let stop = {
            let mut guard = transport.lock().await;
            guard.connection_lost();
            guard.closing || guard.token.is_none()
        };
        if stop {
            break;
        }
        info!("[WS] reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
    }

    let mut guard = transport.lock().await;
    guard.driver_running = false;
    guard.state = ConnectionState::Disconnected;
}

async fn run_connection(
    transport: &Arc<Mutex<SessionTransport>>,
    url: &str,
    token: &str,
) -> Result<(), TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed(format!("bad request: {}", e)))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| TransportError::AuthenticationFailed(format!("bad token: {}", e)))?;
    request.headers_mut().insert("Authorization", bearer);

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    info!("[WS] connected to {}", url);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Authenticated handshake on top of the bearer header: send an auth
    // frame and wait for the server's verdict before opening the session.
    let auth = AuthFrame {
        message_type: "auth".to_string(),
        token: token.to_string(),
    };
    let auth_json = serde_json::to_string(&auth)
        .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?;
    ws_sender
        .send(Message::Text(auth_json))
        .await
        .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?;

    let response = tokio::time::timeout(Duration::from_secs(10), ws_receiver.next()).await;
    match response {
        Ok(Some(Ok(Message::Text(text)))) => {
            let ack: AuthResponse = serde_json::from_str(&text).map_err(|e| {
                TransportError::AuthenticationFailed(format!("bad auth response: {}", e))
            })?;
            if !ack.success {
                return Err(TransportError::AuthenticationFailed(
                    ack.error.unwrap_or_else(|| "rejected".to_string()),
                ));
            }
        }
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
            return Err(TransportError::AuthenticationFailed(
                "connection closed during auth".to_string(),
            ));
        }
        Ok(Some(Ok(_))) => {
            return Err(TransportError::AuthenticationFailed(
                "unexpected frame during auth".to_string(),
            ));
        }
        Ok(Some(Err(e))) => return Err(TransportError::ConnectionFailed(e.to_string())),
        Err(_) => return Err(TransportError::Timeout),
    }

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let (heartbeat_interval, max_missed) = {
        let mut guard = transport.lock().await;
        guard.open_session(outgoing_tx);
        (guard.heartbeat_interval, guard.max_missed_heartbeats)
    };

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_rx = Instant::now();
    let silence_limit = heartbeat_interval * (max_missed + 1);

    loop {
        tokio::select! {
            outbound = outgoing_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = ws_sender.send(msg).await {
                            return Err(TransportError::ConnectionFailed(format!("write failed: {}", e)));
                        }
                        if closing {
                            return Ok(());
                        }
                    }
                    // transport dropped the sender: explicit teardown
                    None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        handle_inbound(transport, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_rx = Instant::now();
                        let _ = ws_sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(TransportError::ConnectionFailed("closed by server".to_string()));
                    }
                    Some(Ok(_)) => {
                        last_rx = Instant::now();
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::ConnectionFailed(e.to_string()));
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_rx.elapsed() > silence_limit {
                    // silent disconnect: no traffic for the configured window
                    return Err(TransportError::Timeout);
                }
                let ping = PingFrame { message_type: "ping".to_string() };
                if let Ok(json) = serde_json::to_string(&ping) {
                    if let Err(e) = ws_sender.send(Message::Text(json)).await {
                        return Err(TransportError::ConnectionFailed(format!("ping failed: {}", e)));
                    }
                }
            }
        }
    }
}

/// Parse one inbound frame and route it. Malformed payloads are logged and
/// dropped here, at the boundary; they never reach subscribers.
async fn handle_inbound(transport: &Arc<Mutex<SessionTransport>>, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("[WS] dropping malformed frame: {}", e);
            return;
        }
    };
    let message_type = value.get("message_type").and_then(|v| v.as_str()).unwrap_or("");
    match message_type {
        "event" => {
            let destination = value.get("destination").and_then(|v| v.as_str());
            let body = value.get("body").cloned();
            match (destination, body) {
                (Some(destination), Some(body)) => {
                    let mut guard = transport.lock().await;
                    guard.dispatch(destination, body);
                }
                _ => warn!("[WS] event frame missing destination or body"),
            }
        }
        "ping" => {
            let mut guard = transport.lock().await;
            let pong = PingFrame { message_type: "pong".to_string() };
            if let Ok(json) = serde_json::to_string(&pong) {
                guard.send_raw(json);
            }
        }
        "pong" => {}
        other => debug!("[WS] ignoring frame type {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport() -> SessionTransport {
        let config = ClientConfig {
            api_base_url: "http://localhost".to_string(),
            ws_url: "ws://localhost/ws".to_string(),
            reconnect_delay_ms: 5000,
            heartbeat_interval_ms: 4000,
            max_missed_heartbeats: 2,
            typing_idle_ms: 2000,
            directory_refresh_secs: 30,
        };
        SessionTransport::new(&config)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[test]
    fn publish_returns_false_when_disconnected() {
        let mut t = transport();
        assert!(!t.publish(APP_CHAT_SEND, json!({ "content": "hi" })));
    }

    #[test]
    fn open_session_issues_subscriptions_and_presence() {
        let mut t = transport();
        let mut sub_rx = t.subscribe(&conversation_topic("c1"));

        let (tx, mut out_rx) = mpsc::unbounded_channel();
        t.open_session(tx);

        let sent = frames(&mut out_rx);
        assert!(sent.iter().any(|f| f["message_type"] == "subscribe"
            && f["destination"] == "/topic/conversation/c1"));
        assert!(sent.iter().any(|f| f["message_type"] == "send"
            && f["destination"] == APP_PRESENCE
            && f["body"]["online"] == true));

        t.dispatch("/topic/conversation/c1", json!({ "id": "m1" }));
        assert_eq!(sub_rx.try_recv().unwrap()["id"], "m1");
    }

    #[test]
    fn reconnect_reissues_subscriptions() {
        let mut t = transport();
        let mut sub_rx = t.subscribe(&conversation_topic("c1"));

        let (tx1, _out1) = mpsc::unbounded_channel();
        t.open_session(tx1);

        t.connection_lost();
        assert!(!t.publish(APP_CHAT_SEND, json!({})));

        let (tx2, mut out2) = mpsc::unbounded_channel();
        t.open_session(tx2);
        let sent = frames(&mut out2);
        assert!(sent.iter().any(|f| f["message_type"] == "subscribe"
            && f["destination"] == "/topic/conversation/c1"));

        // a post-reconnect event on the topic is still delivered
        t.dispatch("/topic/conversation/c1", json!({ "id": "m2" }));
        assert_eq!(sub_rx.try_recv().unwrap()["id"], "m2");
    }

    #[test]
    fn conversation_switch_isolates_stale_events() {
        let mut t = transport();
        let (tx, _out) = mpsc::unbounded_channel();
        t.open_session(tx);

        let mut rx_a = t.subscribe(&conversation_topic("a"));
        t.unsubscribe(&conversation_topic("a"));
        let mut rx_b = t.subscribe(&conversation_topic("b"));

        // stale event still tagged for the old conversation
        t.dispatch(&conversation_topic("a"), json!({ "id": "stale" }));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        t.dispatch(&conversation_topic("b"), json!({ "id": "fresh" }));
        assert_eq!(rx_b.try_recv().unwrap()["id"], "fresh");
    }

    #[test]
    fn dead_subscriber_is_pruned() {
        let mut t = transport();
        let rx = t.subscribe(PRESENCE_TOPIC);
        drop(rx);
        t.dispatch(PRESENCE_TOPIC, json!({ "userId": "u1", "online": true }));
        assert!(!t.subscriptions.contains_key(PRESENCE_TOPIC));
    }

    #[test]
    fn disconnect_announces_offline_and_is_safe_when_never_connected() {
        let mut t = transport();
        t.disconnect(); // no-op, must not panic

        let mut t = transport();
        let (tx, mut out_rx) = mpsc::unbounded_channel();
        t.open_session(tx);
        frames(&mut out_rx); // drain connect-time frames
        t.disconnect();
        let sent = frames(&mut out_rx);
        assert!(sent.iter().any(|f| f["message_type"] == "send"
            && f["destination"] == APP_PRESENCE
            && f["body"]["online"] == false));
        assert!(!t.is_connected());
    }
}
