use std::sync::Arc;

use log::{debug, warn};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::client::models::conversation::Conversation;
use crate::client::models::message::ChatMessage;
use crate::client::utils::session_store;

#[derive(Debug, Clone)]
pub enum ApiError {
    /// Token refresh failed or was rejected twice; caller must force logout.
    Unauthorized,
    Status(u16),
    Network(String),
    Decode(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized: session expired"),
            ApiError::Status(code) => write!(f, "Server returned status {}", code),
            ApiError::Network(msg) => write!(f, "Network error: {}", msg),
            ApiError::Decode(msg) => write!(f, "Malformed response: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Default)]
pub struct AuthTokens {
    pub access: String,
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    token: String,
    refresh_token: Option<String>,
}

/// Server pages are wrapped in a `content` envelope.
#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    content: Vec<T>,
}

/// Bearer-authenticated REST boundary. Cloneable: the underlying
/// `reqwest::Client` is shared, and the token cell is shared so a refresh
/// performed by one clone is visible to all.
///
/// Retry policy: a 401 triggers exactly one token refresh and one replay of
/// the original request; a second rejection surfaces `ApiError::Unauthorized`.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<Mutex<AuthTokens>>,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: AuthTokens) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(Mutex::new(tokens)),
        }
    }

    pub async fn access_token(&self) -> String {
        self.tokens.lock().await.access.clone()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn raw(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let mut request = self
            .http
            .request(method, self.endpoint(path))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let token = self.access_token().await;
        let mut response = self.raw(method.clone(), path, body.as_ref(), &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("[API] 401 on {}, attempting token refresh", path);
            self.refresh_tokens().await?;
            let token = self.access_token().await;
            response = self.raw(method, path, body.as_ref(), &token).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(ApiError::Unauthorized);
            }
        }

        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    /// Replace the token pair via `/api/auth/refresh`. Auth endpoints are
    /// never themselves retried on 401.
    async fn refresh_tokens(&self) -> Result<(), ApiError> {
        let refresh = {
            let tokens = self.tokens.lock().await;
            tokens.refresh.clone().ok_or(ApiError::Unauthorized)?
        };
        let response = self
            .http
            .post(self.endpoint("/api/auth/refresh"))
            .json(&json!({ "refreshToken": refresh }))
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::Unauthorized);
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        let mut tokens = self.tokens.lock().await;
        tokens.access = refreshed.token.clone();
        if let Some(new_refresh) = refreshed.refresh_token.clone() {
            tokens.refresh = Some(new_refresh);
        }
        if let Err(e) = session_store::save_tokens(&tokens.access, tokens.refresh.as_deref()) {
            warn!("[API] failed to persist refreshed tokens: {}", e);
        }
        Ok(())
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn get_me(&self) -> Result<UserProfile, ApiError> {
        let response = self.execute(Method::GET, "/api/users/me", None).await?;
        Self::decode(response).await
    }

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let response = self.execute(Method::GET, "/api/conversations", None).await?;
        Self::decode(response).await
    }

    /// Returns the page newest-first, exactly as the server sends it; the
    /// chat service reverses it for chronological display.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        page: u32,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let path = format!("/api/conversations/{}/messages?page={}", conversation_id, page);
        let response = self.execute(Method::GET, &path, None).await?;
        let page: Page<ChatMessage> = Self::decode(response).await?;
        Ok(page.content)
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ApiError> {
        let path = format!("/api/conversations/{}/messages", conversation_id);
        let response = self
            .execute(Method::POST, &path, Some(json!({ "content": content })))
            .await?;
        Self::decode(response).await
    }

    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/conversations/{}/read", conversation_id);
        self.execute(Method::POST, &path, None).await?;
        Ok(())
    }

    pub async fn mark_as_delivered(&self, conversation_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/conversations/{}/delivered", conversation_id);
        self.execute(Method::POST, &path, None).await?;
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        participant_ids: &[String],
    ) -> Result<Conversation, ApiError> {
        let response = self
            .execute(
                Method::POST,
                "/api/conversations",
                Some(json!({ "participantIds": participant_ids })),
            )
            .await?;
        Self::decode(response).await
    }

    pub async fn remove_match(&self, user_id: &str, delete_chat: bool) -> Result<(), ApiError> {
        let path = format!("/api/matches/user/{}?deleteChat={}", user_id, delete_chat);
        self.execute(Method::DELETE, &path, None).await?;
        Ok(())
    }
}
