use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nearswarm_cache::RateLimiter;
use nearswarm_models::{ConfigError, LlmSettings};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AgentError;

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";
pub const HYPERBOLIC_API_URL: &str = "https://api.hyperbolic.xyz/v1";

/// Canned answer returned by [`MockProvider`].
pub const MOCK_RESPONSE: &str = r#"{"decision": true, "confidence": 0.85, "reasoning": "Market conditions are favorable with low risk."}"#;

/// A text-completion backend. Mockable for testing.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Send one request and return the raw text of the reply.
    async fn query(&self, system: &str, prompt: &str) -> Result<String, AgentError>;
}

/// Build the provider named in `settings.provider` with a limiter of its own.
///
/// Agents should go through [`crate::AgentServices`] instead, which hands one
/// limiter to every provider it builds.
pub fn create_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let limiter = settings
        .requests_per_minute
        .map(|rpm| Arc::new(RateLimiter::per_minute(rpm)));
    create_provider_with(settings, limiter)
}

/// Build the provider named in `settings.provider` on top of `limiter`.
pub fn create_provider_with(
    settings: &LlmSettings,
    limiter: Option<Arc<RateLimiter>>,
) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    settings.validate()?;
    let provider: Arc<dyn LlmProvider> = match settings.provider.to_ascii_lowercase().as_str() {
        "openai" => Arc::new(OpenAiProvider::new(settings.clone(), limiter)?),
        "hyperbolic" => Arc::new(HyperbolicProvider::new(settings.clone(), limiter)?),
        "mock" => Arc::new(MockProvider::default()),
        other => {
            return Err(ConfigError::invalid(
                "llm.provider",
                format!("unsupported provider {other:?}"),
            ))
        }
    };
    debug!(provider = provider.name(), model = %settings.model, "created LLM provider");
    Ok(provider)
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn http_client() -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ConfigError::invalid("llm", format!("cannot build HTTP client: {e}")))
}

async fn post_json<T: Serialize, R: for<'de> Deserialize<'de>>(
    http: &reqwest::Client,
    limiter: Option<&RateLimiter>,
    url: &str,
    api_key: &str,
    body: &T,
) -> Result<R, AgentError> {
    if let Some(limiter) = limiter {
        limiter.acquire().await;
    }
    let response = http
        .post(url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(REQUEST_TIMEOUT.as_millis() as u64)
            } else {
                AgentError::Llm(e)
            }
        })?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AgentError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI chat completions, asking for a JSON object reply.
pub struct OpenAiProvider {
    settings: LlmSettings,
    http: reqwest::Client,
    limiter: Option<Arc<RateLimiter>>,
}

impl OpenAiProvider {
    pub fn new(settings: LlmSettings, limiter: Option<Arc<RateLimiter>>) -> Result<Self, ConfigError> {
        Ok(Self {
            settings,
            http: http_client()?,
            limiter,
        })
    }

    fn endpoint(&self) -> String {
        let base = self.settings.api_url.as_deref().unwrap_or(OPENAI_API_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn query(&self, system: &str, prompt: &str) -> Result<String, AgentError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let response: ChatResponse = post_json(
            &self.http,
            self.limiter.as_deref(),
            &self.endpoint(),
            &self.settings.api_key,
            &request,
        )
        .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AgentError::Parse("OpenAI response has no message content".into()))
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    text: String,
}

/// Hyperbolic's plain completions endpoint. System and user text share one prompt.
pub struct HyperbolicProvider {
    settings: LlmSettings,
    http: reqwest::Client,
    limiter: Option<Arc<RateLimiter>>,
}

impl HyperbolicProvider {
    pub fn new(settings: LlmSettings, limiter: Option<Arc<RateLimiter>>) -> Result<Self, ConfigError> {
        Ok(Self {
            settings,
            http: http_client()?,
            limiter,
        })
    }

    fn endpoint(&self) -> String {
        let base = self.settings.api_url.as_deref().unwrap_or(HYPERBOLIC_API_URL);
        format!("{}/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for HyperbolicProvider {
    fn name(&self) -> &str {
        "hyperbolic"
    }

    async fn query(&self, system: &str, prompt: &str) -> Result<String, AgentError> {
        let request = CompletionRequest {
            model: &self.settings.model,
            prompt: format!("{system}\n\n{prompt}"),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: false,
        };
        let response: CompletionResponse = post_json(
            &self.http,
            self.limiter.as_deref(),
            &self.endpoint(),
            &self.settings.api_key,
            &request,
        )
        .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or_else(|| AgentError::Parse("Hyperbolic response has no choices".into()))
    }
}

/// Offline provider that always approves. Used by `provider = "mock"`.
pub struct MockProvider {
    response: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            response: MOCK_RESPONSE.to_string(),
        }
    }
}

impl MockProvider {
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query(&self, _system: &str, _prompt: &str) -> Result<String, AgentError> {
        Ok(self.response.clone())
    }
}
