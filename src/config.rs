use std::env;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub typing_idle_ms: u64,
    pub directory_refresh_secs: u64,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            api_base_url: env::var("STUDYMATCH_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            ws_url: env::var("STUDYMATCH_WS_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string()),
            reconnect_delay_ms: env::var("STUDYMATCH_RECONNECT_DELAY_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            heartbeat_interval_ms: env::var("STUDYMATCH_HEARTBEAT_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(4000),
            max_missed_heartbeats: env::var("STUDYMATCH_MAX_MISSED_HEARTBEATS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(2),
            typing_idle_ms: env::var("STUDYMATCH_TYPING_IDLE_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(2000),
            directory_refresh_secs: env::var("STUDYMATCH_DIRECTORY_REFRESH_SECS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(30),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
