//! Blocking HTTP clients for the language-generation and speech-synthesis providers.
//!
//! - Uses `ureq` with a per-agent global timeout; no async.
//! - Status codes are classified into `ProviderError` so callers can decide what
//!   is worth retrying.

use crate::models::message::SchedulePhase;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const APP_REFERER: &str = "https://plantvoicelabs.com";
const APP_TITLE: &str = "Plant Voice Labs";

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Timeout,
    RateLimited,
    /// 5xx from the provider.
    Unavailable { status: u16, message: String },
    Transport(String),
    /// 401/403: bad or missing credentials.
    Auth { status: u16, message: String },
    /// Any other 4xx: the request itself is wrong.
    MalformedInput { status: u16, message: String },
    Decode(String),
    Io(String),
}

impl core::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProviderError::Timeout => write!(f, "request timed out"),
            ProviderError::RateLimited => write!(f, "rate limited"),
            ProviderError::Unavailable { status, message } => write!(f, "provider unavailable (http {}): {}", status, message),
            ProviderError::Transport(s) => write!(f, "transport error: {}", s),
            ProviderError::Auth { status, message } => write!(f, "auth error (http {}): {}", status, message),
            ProviderError::MalformedInput { status, message } => write!(f, "rejected request (http {}): {}", status, message),
            ProviderError::Decode(s) => write!(f, "decode error: {}", s),
            ProviderError::Io(s) => write!(f, "io error: {}", s),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Timeouts, throttling, provider outages and network hiccups may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::RateLimited
                | ProviderError::Unavailable { .. }
                | ProviderError::Transport(_)
        )
    }

    pub fn from_status(status: StatusCode, message: String) -> Self {
        let code = status.as_u16();
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth { status: code, message },
            s if s.is_server_error() => ProviderError::Unavailable { status: code, message },
            _ => ProviderError::MalformedInput { status: code, message },
        }
    }
}

impl From<ureq::Error> for ProviderError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Timeout(_) => ProviderError::Timeout,
            ureq::Error::StatusCode(code) => match StatusCode::from_u16(code) {
                Ok(status) => ProviderError::from_status(status, String::new()),
                Err(_) => ProviderError::Transport(format!("invalid status {}", code)),
            },
            ureq::Error::Json(e) => ProviderError::Decode(e.to_string()),
            other => ProviderError::Transport(other.to_string()),
        }
    }
}

/// Agent shared by both clients. Status codes are returned, not raised, so the body of
/// an error response can be logged.
pub fn build_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    config.into()
}

fn error_for(mut resp: http::Response<ureq::Body>) -> ProviderError {
    let status = resp.status();
    let body = resp
        .body_mut()
        .read_to_string()
        .unwrap_or_else(|_| String::from("<no body>"));
    ProviderError::from_status(status, body)
}

// =====================
// Language generation
// =====================

#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub prompt: String,
    pub phase: SchedulePhase,
}

pub trait LanguageModel: Send + Sync {
    fn complete(&self, request: &PromptRequest) -> Result<String, ProviderError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completion endpoint (OpenRouter by default).
pub struct OpenRouterClient {
    agent: ureq::Agent,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(agent: ureq::Agent, url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Self {
        OpenRouterClient {
            agent,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
        }
    }
}

impl LanguageModel for OpenRouterClient {
    fn complete(&self, request: &PromptRequest) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: self.max_tokens,
        };
        let mut resp = self
            .agent
            .post(&self.url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .send_json(&body)?;
        if !resp.status().is_success() {
            return Err(error_for(resp));
        }
        let parsed: ChatResponse = resp.body_mut().read_json()?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Decode("completion carried no text".to_string()))
    }
}

// =====================
// Speech synthesis
// =====================

pub trait SpeechSynthesizer: Send + Sync {
    /// Returns encoded audio (mp3).
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

pub struct ElevenLabsClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsClient {
    pub fn new(
        agent: ureq::Agent,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        ElevenLabsClient {
            agent,
            base_url: base_url.into(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl SpeechSynthesizer for ElevenLabsClient {
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/text-to-speech/{}", self.base_url.trim_end_matches('/'), self.voice_id);
        let body = TtsRequest {
            text,
            model_id: &self.model_id,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                style: 0.5,
                use_speaker_boost: true,
            },
        };
        let mut resp = self
            .agent
            .post(&url)
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", &self.api_key)
            .send_json(&body)?;
        if !resp.status().is_success() {
            return Err(error_for(resp));
        }
        let audio = resp.body_mut().read_to_vec()?;
        if audio.is_empty() {
            return Err(ProviderError::Decode("empty audio body".to_string()));
        }
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ProviderError::RateLimited
        );
        assert!(ProviderError::from_status(StatusCode::BAD_GATEWAY, "down".into()).is_transient());
        assert!(ProviderError::from_status(StatusCode::GATEWAY_TIMEOUT, String::new()).is_transient());

        let auth = ProviderError::from_status(StatusCode::UNAUTHORIZED, "bad key".into());
        assert!(matches!(auth, ProviderError::Auth { status: 401, .. }));
        assert!(!auth.is_transient());

        let bad = ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "prompt".into());
        assert!(matches!(bad, ProviderError::MalformedInput { status: 422, .. }));
        assert!(!bad.is_transient());
    }

    #[test]
    fn chat_response_without_content_is_tolerated_by_serde() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
