use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use runloop_types::{Message, MessageRole, ModelInfo, ProviderInfo, ToolCallRequest, ToolSchema};

mod openai;
mod scripted;

pub use openai::OpenAICompatibleProvider;
pub use scripted::{ScriptStep, ScriptedProvider, ScriptedTurn};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls: if message.role == MessageRole::Assistant {
                message.tool_calls.clone()
            } else {
                Vec::new()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, args_delta: String },
    ToolCallEnd { id: String },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// A streaming chat model. Retry and backoff inside one `stream` call are
/// the provider's business; callers only bound the total wait.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    RateLimit,
    Timeout,
    Authentication,
    ServerError,
    RequestFailed,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimit => "RATE_LIMIT",
            ProviderErrorKind::Timeout => "TIMEOUT",
            ProviderErrorKind::Authentication => "AUTHENTICATION",
            ProviderErrorKind::ServerError => "SERVER_ERROR",
            ProviderErrorKind::RequestFailed => "REQUEST_FAILED",
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ProviderErrorKind::Authentication,
            408 | 504 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500..=599 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::RequestFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.kind.as_str(), status, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classifies a provider failure. Typed errors win; transport errors and
/// free-form messages fall back to status and keyword matching.
pub fn classify_provider_error(err: &anyhow::Error) -> ProviderErrorKind {
    for cause in err.chain() {
        if let Some(provider_err) = cause.downcast_ref::<ProviderError>() {
            return provider_err.kind;
        }
        if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
            if http_err.is_timeout() {
                return ProviderErrorKind::Timeout;
            }
            if let Some(status) = http_err.status() {
                return ProviderErrorKind::from_status(status.as_u16());
            }
            if http_err.is_connect() {
                return ProviderErrorKind::ServerError;
            }
        }
    }
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("rate limit") || text.contains("429") || text.contains("too many requests") {
        ProviderErrorKind::RateLimit
    } else if text.contains("timeout") || text.contains("timed out") {
        ProviderErrorKind::Timeout
    } else if text.contains("401")
        || text.contains("unauthorized")
        || text.contains("authentication")
        || text.contains("api key")
    {
        ProviderErrorKind::Authentication
    } else if text.contains("500") || text.contains("502") || text.contains("503") {
        ProviderErrorKind::ServerError
    } else {
        ProviderErrorKind::RequestFailed
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = build_providers(&config);
        Self::with_providers(providers, config.default_provider)
    }

    pub fn with_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers.read().await.iter().map(|p| p.info()).collect()
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_id).await?;
        provider.stream(messages, model_id, tools, cancel).await
    }

    pub async fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        }

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        }

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

struct BuiltinProvider {
    id: &'static str,
    name: &'static str,
    url: &'static str,
    model: &'static str,
    key_env: Option<&'static str>,
}

const BUILTIN_PROVIDERS: &[BuiltinProvider] = &[
    BuiltinProvider {
        id: "ollama",
        name: "Ollama",
        url: "http://127.0.0.1:11434/v1",
        model: "llama3.1:8b",
        key_env: None,
    },
    BuiltinProvider {
        id: "openai",
        name: "OpenAI",
        url: "https://api.openai.com/v1",
        model: "gpt-4o-mini",
        key_env: Some("OPENAI_API_KEY"),
    },
    BuiltinProvider {
        id: "openrouter",
        name: "OpenRouter",
        url: "https://openrouter.ai/api/v1",
        model: "openai/gpt-4o-mini",
        key_env: Some("OPENROUTER_API_KEY"),
    },
    BuiltinProvider {
        id: "groq",
        name: "Groq",
        url: "https://api.groq.com/openai/v1",
        model: "llama-3.1-8b-instant",
        key_env: Some("GROQ_API_KEY"),
    },
    BuiltinProvider {
        id: "mistral",
        name: "Mistral",
        url: "https://api.mistral.ai/v1",
        model: "mistral-small-latest",
        key_env: Some("MISTRAL_API_KEY"),
    },
];

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for builtin in BUILTIN_PROVIDERS {
        let Some(entry) = config.providers.get(builtin.id) else {
            continue;
        };
        let api_key = builtin.key_env.and_then(|env_name| {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(str::to_string)
                .or_else(|| std::env::var(env_name).ok().filter(|v| !v.trim().is_empty()))
        });
        providers.push(Arc::new(OpenAICompatibleProvider::new(
            builtin.id,
            builtin.name,
            entry.url.as_deref().unwrap_or(builtin.url),
            api_key,
            entry.default_model.as_deref().unwrap_or(builtin.model),
        )));
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

/// Answers every turn by echoing the last user message. Used when no
/// provider is configured so a local engine still completes runs.
pub struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(format!("Echo: {prompt}"))),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}
