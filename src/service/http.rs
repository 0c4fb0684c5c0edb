//! HTTP client for the chat backend
//!
//! Implements completion, speech synthesis and conversation history against
//! the backend REST API, plus model listing and a health probe.

use super::{AudioClip, CompletionService, ConversationStore, ConversationSummary, SpeechSynthesis};
use crate::messages::{Message, Role};
use crate::{ColloquyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Connection settings for the backend
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, without the `/api` prefix
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 120,
            auth_token: None,
        }
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Model offered by the backend
#[derive(Clone, Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    capture: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ConversationList {
    #[serde(default)]
    conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
struct StoredConversation {
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

#[derive(Deserialize)]
struct StoredMessage {
    role: String,
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

impl StoredMessage {
    fn into_message(self) -> Option<Message> {
        let role = match self.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                debug!("Skipping stored message with role {}", other);
                return None;
            }
        };
        let mut message = Message::new(role, self.content);
        if let Some(ts) = self.timestamp.as_deref().and_then(parse_timestamp) {
            message.timestamp = ts;
        }
        Some(message)
    }
}

/// Accepts RFC 3339 and the naive ISO form the backend stores
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// REST client for the chat backend
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List models available on the backend
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let resp = self.send(self.request(Method::GET, "/api/models")).await?;
        let list: ModelList = resp.json().await?;
        Ok(list.models)
    }

    /// First model the backend offers, if any
    pub async fn first_model(&self) -> Result<Option<String>> {
        let models = self.list_models().await?;
        Ok(models.into_iter().next().map(|m| m.name))
    }

    /// Probe the backend health endpoint
    pub async fn health(&self) -> Result<()> {
        self.send(self.request(Method::GET, "/health")).await?;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = error_detail(status, &body);
        warn!("Backend returned {}: {}", status, detail);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ColloquyError::Unauthorized(detail))
            }
            _ => Err(ColloquyError::BackendError {
                status: status.as_u16(),
                detail,
            }),
        }
    }
}

/// Extract the backend's `detail` field, falling back to the status reason
fn error_detail(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(detail),
        }) => detail,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}

#[async_trait]
impl CompletionService for HttpBackend {
    async fn complete(&self, model: &str, transcript: &[Message]) -> Result<Message> {
        let request = ChatRequest {
            model,
            messages: transcript
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: false,
            capture: true,
        };
        debug!("Requesting completion from {} ({} messages)", model, transcript.len());

        let resp = self
            .send(self.request(Method::POST, "/api/chat").json(&request))
            .await?;
        let reply: ChatResponse = resp.json().await?;
        Ok(Message::assistant(reply.message.content))
    }
}

#[async_trait]
impl SpeechSynthesis for HttpBackend {
    async fn synthesize(&self, text: &str, language: &str) -> Result<AudioClip> {
        let request = SynthesisRequest { text, language };
        let resp = self
            .send(self.request(Method::POST, "/api/voice/synthesize").json(&request))
            .await
            .map_err(|e| ColloquyError::SynthesisError(e.to_string()))?;

        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let data = resp
            .bytes()
            .await
            .map_err(|e| ColloquyError::SynthesisError(e.to_string()))?;

        if data.is_empty() {
            return Err(ColloquyError::SynthesisError("empty audio response".into()));
        }
        Ok(AudioClip::new(data.to_vec(), mime_type))
    }
}

#[async_trait]
impl ConversationStore for HttpBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let resp = self
            .send(self.request(Method::GET, "/api/conversations/"))
            .await?;
        let list: ConversationList = resp.json().await?;
        Ok(list.conversations)
    }

    async fn load_conversation(&self, id: &str) -> Result<Vec<Message>> {
        let resp = self
            .send(self.request(Method::GET, &format!("/api/conversations/{}", id)))
            .await?;
        let conversation: StoredConversation = resp.json().await?;
        Ok(conversation
            .messages
            .into_iter()
            .filter_map(StoredMessage::into_message)
            .collect())
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, &format!("/api/conversations/{}", id)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_prefers_json_detail() {
        let detail = error_detail(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"detail":"No Ollama server available"}"#,
        );
        assert_eq!(detail, "No Ollama server available");
    }

    #[test]
    fn test_error_detail_falls_back_to_reason() {
        let detail = error_detail(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert_eq!(detail, "Bad Gateway");
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert!(parse_timestamp("2024-05-01T10:15:00Z").is_some());
        assert!(parse_timestamp("2024-05-01T10:15:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_stored_message_skips_unknown_roles() {
        let system = StoredMessage {
            role: "system".into(),
            content: "You are helpful".into(),
            timestamp: None,
        };
        assert!(system.into_message().is_none());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let backend = HttpBackend::new(BackendConfig::new("http://localhost:8000/")).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:8000");
    }
}
