// AI Provider Service
// OpenAI-compatible chat completions for GLM and DeepSeek, plus credential lookup

use super::config_store::{AppConfig, ConfigStore};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const GLM_DEFAULT_URL: &str = "https://open.bigmodel.cn/api/paas/v4/chat/completions";
const DEEPSEEK_DEFAULT_URL: &str = "https://api.deepseek.com/chat/completions";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured")]
    MissingApiKey,
    #[error("request timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Glm,
    Deepseek,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "glm" => Some(Self::Glm),
            "deepseek" => Some(Self::Deepseek),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Glm => "glm",
            Self::Deepseek => "deepseek",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Glm => "glm-4.6",
            Self::Deepseek => "deepseek-chat",
        }
    }

    fn env_key_names(&self) -> &'static [&'static str] {
        match self {
            Self::Glm => &["GLM_API_KEY", "CHEEKAI_GLM_API_KEY"],
            Self::Deepseek => &["DEEPSEEK_API_KEY", "CHEEKAI_DEEPSEEK_API_KEY"],
        }
    }

    fn env_url_name(&self) -> &'static str {
        match self {
            Self::Glm => "GLM_API_URL",
            Self::Deepseek => "DEEPSEEK_API_URL",
        }
    }

    fn default_url(&self) -> &'static str {
        match self {
            Self::Glm => GLM_DEFAULT_URL,
            Self::Deepseek => DEEPSEEK_DEFAULT_URL,
        }
    }

    /// GLM accepts `response_format: json_object` unconditionally.
    fn forces_json_format(&self) -> bool {
        matches!(self, Self::Glm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub model: String,
}

impl ProviderSpec {
    /// `name:model` label used in judgment signals.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind.name(), self.model)
    }
}

/// Parse `name[:model]`. Unknown provider names yield `None`.
pub fn parse_provider(spec: &str) -> Option<ProviderSpec> {
    let (name, model) = match spec.split_once(':') {
        Some((n, m)) => (n, m.trim()),
        None => (spec, ""),
    };
    let kind = ProviderKind::from_name(name)?;
    let model = if model.is_empty() {
        kind.default_model().to_string()
    } else {
        model.to_string()
    };
    Some(ProviderSpec { kind, model })
}

/// Judge for requests that name no providers, from `defaultProvider`
/// (GLM when unset or unknown). Without an explicit `:model` the model is
/// `providers.<name>.model`, then `llm.judgmentModel` for GLM, then the
/// provider's built-in default.
pub fn default_judge(config: &AppConfig) -> ProviderSpec {
    let configured = config
        .default_provider
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let parsed = configured.and_then(|spec| {
        let parsed = parse_provider(spec);
        if parsed.is_none() {
            warn!("[PROVIDER] Unknown defaultProvider {}, using glm", spec);
        }
        let explicit = spec.split_once(':').is_some_and(|(_, m)| !m.trim().is_empty());
        parsed.map(|p| (p, explicit))
    });

    let (mut judge, explicit) = parsed.unwrap_or_else(|| {
        let glm = ProviderKind::Glm;
        (ProviderSpec { kind: glm, model: glm.default_model().to_string() }, false)
    });
    if !explicit {
        let provider_model = config
            .providers
            .get(judge.kind.name())
            .and_then(|p| p.model.as_deref())
            .map(str::trim)
            .filter(|m| !m.is_empty());
        judge.model = match (provider_model, judge.kind) {
            (Some(model), _) => model.to_string(),
            (None, ProviderKind::Glm) => config.llm.judgment_model.clone(),
            (None, kind) => kind.default_model().to_string(),
        };
    }
    judge
}

/// Parse a list of specs, dropping unknown names with a warning.
pub fn parse_providers(specs: &[String]) -> Vec<ProviderSpec> {
    specs
        .iter()
        .filter_map(|s| {
            let parsed = parse_provider(s);
            if parsed.is_none() {
                warn!("[PROVIDER] Ignoring unknown provider spec: {}", s);
            }
            parsed
        })
        .collect()
}

/// One chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub enable_reasoning: bool,
    pub reasoning_effort: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatResult {
    /// May be empty when the model only produced reasoning.
    pub content: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

pub type ChatFuture<'a> = Pin<Box<dyn Future<Output = Result<ChatResult, ProviderError>> + Send + 'a>>;

/// Chat-completion capability consumed by the planner and the judgment step.
pub trait ChatBackend: Send + Sync {
    fn chat_complete<'a>(&'a self, request: &'a ChatCompletion) -> ChatFuture<'a>;
}

/// API key lookup for a provider.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self, provider: ProviderKind) -> Option<String>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningConfig>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Clone, Serialize)]
struct ReasoningConfig {
    effort: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
    reasoning_content: Option<String>,
}

pub struct ProviderClient {
    client: Client,
    urls: HashMap<ProviderKind, String>,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new(80)
    }
}

impl ProviderClient {
    /// Client with env-var URL overrides (`GLM_API_URL`, `DEEPSEEK_API_URL`).
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        let urls = [ProviderKind::Glm, ProviderKind::Deepseek]
            .into_iter()
            .map(|kind| {
                let url = env::var(kind.env_url_name()).unwrap_or_else(|_| kind.default_url().to_string());
                (kind, url)
            })
            .collect();

        Self { client, urls }
    }

    /// Client honouring `llm.timeoutSecs` and per-provider `baseUrl` from config.
    /// Environment URLs still take precedence.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut provider_client = Self::new(config.llm.timeout_secs);
        for (name, provider) in &config.providers {
            let (Some(kind), Some(url)) = (ProviderKind::from_name(name), provider.base_url.as_ref()) else {
                continue;
            };
            if env::var(kind.env_url_name()).is_err() && !url.trim().is_empty() {
                provider_client.urls.insert(kind, url.trim().to_string());
            }
        }
        provider_client
    }

    pub fn url_for(&self, kind: ProviderKind) -> &str {
        self.urls
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_url())
    }

    async fn call_chat_api(&self, request: &ChatCompletion) -> Result<ChatResult, ProviderError> {
        if request.api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let body = ChatRequest {
            model: request.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            max_tokens: request.max_tokens,
            temperature: 0.0,
            response_format: request.provider.forces_json_format().then(|| ResponseFormat {
                r#type: "json_object".to_string(),
            }),
            reasoning: request.enable_reasoning.then(|| ReasoningConfig {
                effort: request.reasoning_effort.clone(),
            }),
        };

        let url = self.url_for(request.provider);
        let start = Instant::now();

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", request.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let message = data
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref());

        let content = message.and_then(|m| m.content.clone()).unwrap_or_default();
        let reasoning = message
            .and_then(|m| m.reasoning_content.clone())
            .or(data.reasoning_content);

        debug!(
            "[PROVIDER] {} model={} latency_ms={} content_len={}",
            request.provider.name(),
            request.model,
            latency_ms,
            content.len()
        );

        Ok(ChatResult {
            content,
            latency_ms,
            reasoning,
        })
    }
}

impl ChatBackend for ProviderClient {
    fn chat_complete<'a>(&'a self, request: &'a ChatCompletion) -> ChatFuture<'a> {
        Box::pin(self.call_chat_api(request))
    }
}

fn json_span_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("json span regex"))
}

/// First `{` through last `}` in `text`, if any.
pub fn extract_json_span(text: &str) -> Option<&str> {
    json_span_re().find(text).map(|m| m.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    ReasoningDisabled,
}

/// Call the backend, recovering JSON from reasoning text when content is
/// empty and retrying once with reasoning disabled.
pub async fn complete_with_recovery(
    backend: &dyn ChatBackend,
    request: &ChatCompletion,
) -> Result<ChatResult, ProviderError> {
    let mut current = request.clone();
    let mut attempt = Attempt::Initial;

    loop {
        let mut result = backend.chat_complete(&current).await?;

        if result.content.trim().is_empty() {
            if let Some(span) = result.reasoning.as_deref().and_then(extract_json_span) {
                result.content = span.to_string();
            }
        }
        if !result.content.trim().is_empty() {
            return Ok(result);
        }

        match attempt {
            Attempt::Initial if current.enable_reasoning => {
                warn!(
                    "[PROVIDER] Empty content from {} ({}), retrying without reasoning",
                    current.provider.name(),
                    current.model
                );
                current.enable_reasoning = false;
                attempt = Attempt::ReasoningDisabled;
            }
            _ => return Err(ProviderError::MissingContent),
        }
    }
}

/// `complete_with_recovery` bounded by a deadline covering both attempts.
pub async fn complete_with_timeout(
    backend: &dyn ChatBackend,
    request: &ChatCompletion,
    timeout: Duration,
) -> Result<ChatResult, ProviderError> {
    tokio::time::timeout(timeout, complete_with_recovery(backend, request))
        .await
        .map_err(|_| ProviderError::Timeout(timeout.as_secs()))?
}

/// Environment variables first, then `apiKeys` in the config file.
pub struct EnvCredentials {
    store: Option<ConfigStore>,
}

impl EnvCredentials {
    pub fn new(store: Option<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn from_default_store() -> Self {
        Self::new(ConfigStore::open_default())
    }
}

impl CredentialSource for EnvCredentials {
    fn api_key(&self, provider: ProviderKind) -> Option<String> {
        for key in provider.env_key_names() {
            if let Ok(val) = env::var(key) {
                let v = val.trim();
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }

        let store = self.store.as_ref()?;
        match store.get_api_key(provider.name()) {
            Ok(key) => key,
            Err(e) => {
                warn!("[PROVIDER] Failed to read API key from config: {}", e);
                None
            }
        }
    }
}

/// Fixed keys, e.g. passed on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<ProviderKind, String>,
}

impl StaticCredentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn api_key(&self, provider: ProviderKind) -> Option<String> {
        self.keys.get(&provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned results and records the reasoning flag of each call.
    struct Scripted {
        replies: Mutex<Vec<Result<ChatResult, ProviderError>>>,
        seen_reasoning: Mutex<Vec<bool>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<ChatResult, ProviderError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen_reasoning: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChatBackend for Scripted {
        fn chat_complete<'a>(&'a self, request: &'a ChatCompletion) -> ChatFuture<'a> {
            self.seen_reasoning.lock().unwrap().push(request.enable_reasoning);
            let next = self.replies.lock().unwrap().pop().unwrap_or(Err(ProviderError::MissingContent));
            Box::pin(async move { next })
        }
    }

    fn reply(content: &str, reasoning: Option<&str>) -> Result<ChatResult, ProviderError> {
        Ok(ChatResult {
            content: content.to_string(),
            latency_ms: 5,
            reasoning: reasoning.map(str::to_string),
        })
    }

    fn request(enable_reasoning: bool) -> ChatCompletion {
        ChatCompletion {
            provider: ProviderKind::Glm,
            model: "glm-4.6".to_string(),
            api_key: "k".to_string(),
            system: "s".to_string(),
            user: "u".to_string(),
            max_tokens: 16,
            enable_reasoning,
            reasoning_effort: "high".to_string(),
        }
    }

    #[test]
    fn test_parse_provider() {
        let spec = parse_provider("glm:glm-4-plus").unwrap();
        assert_eq!(spec.kind, ProviderKind::Glm);
        assert_eq!(spec.model, "glm-4-plus");

        let spec2 = parse_provider("deepseek").unwrap();
        assert_eq!(spec2.model, "deepseek-chat");
        assert_eq!(spec2.label(), "deepseek:deepseek-chat");

        assert!(parse_provider("openai:gpt").is_none());
        let parsed = parse_providers(&["glm".to_string(), "nope".to_string()]);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_default_judge_resolution() {
        let mut config = AppConfig::default();
        config.llm.judgment_model = "glm-4-air".to_string();
        assert_eq!(default_judge(&config).label(), "glm:glm-4-air");

        config.default_provider = Some("deepseek".to_string());
        assert_eq!(default_judge(&config).label(), "deepseek:deepseek-chat");

        config.providers.insert(
            "deepseek".to_string(),
            crate::services::config_store::ProviderConfig {
                model: Some("deepseek-reasoner".to_string()),
                base_url: None,
            },
        );
        assert_eq!(default_judge(&config).label(), "deepseek:deepseek-reasoner");

        config.default_provider = Some("deepseek:deepseek-v3".to_string());
        assert_eq!(default_judge(&config).label(), "deepseek:deepseek-v3");

        config.default_provider = Some("openai:gpt".to_string());
        assert_eq!(default_judge(&config).label(), "glm:glm-4-air");
    }

    #[test]
    fn test_provider_client_creation() {
        let client = ProviderClient::default();
        assert!(client.url_for(ProviderKind::Deepseek).contains("deepseek"));
    }

    #[test]
    fn test_extract_json_span() {
        assert_eq!(extract_json_span("noise {\"a\":{\"b\":1}} tail"), Some("{\"a\":{\"b\":1}}"));
        assert_eq!(extract_json_span("a\n{\n}\n"), Some("{\n}"));
        assert!(extract_json_span("none").is_none());
    }

    #[tokio::test]
    async fn test_recovers_json_from_reasoning() {
        let backend = Scripted::new(vec![reply("", Some("thinking... {\"ok\":1} done"))]);
        let result = complete_with_recovery(&backend, &request(true)).await.unwrap();
        assert_eq!(result.content, "{\"ok\":1}");
        assert_eq!(*backend.seen_reasoning.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_retries_once_without_reasoning() {
        let backend = Scripted::new(vec![reply("", None), reply("{\"x\":2}", None)]);
        let result = complete_with_recovery(&backend, &request(true)).await.unwrap();
        assert_eq!(result.content, "{\"x\":2}");
        assert_eq!(*backend.seen_reasoning.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_gives_up_after_single_retry() {
        let backend = Scripted::new(vec![reply("", None), reply("  ", None), reply("{}", None)]);
        let err = complete_with_recovery(&backend, &request(true)).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingContent));
        assert_eq!(backend.seen_reasoning.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_reasoning_already_off() {
        let backend = Scripted::new(vec![reply("", None), reply("{}", None)]);
        assert!(complete_with_recovery(&backend, &request(false)).await.is_err());
        assert_eq!(backend.seen_reasoning.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::none().with_key(ProviderKind::Glm, "abc");
        assert_eq!(creds.api_key(ProviderKind::Glm).as_deref(), Some("abc"));
        assert!(creds.api_key(ProviderKind::Deepseek).is_none());
    }
}
