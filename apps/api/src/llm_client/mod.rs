/// Text-generation client — the single point of entry for all calls to the
/// external generation service.
///
/// The transformation core only sees `Arc<dyn TextGenerationClient>`. The
/// concrete backend (`AnthropicClient`, `GeminiClient` or the offline
/// `DummyClient`) is chosen at startup by `build_client`, optionally wrapped by
/// the reply cache and the exchange archive.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ClientKind, Config};

pub mod cache;
pub mod exchange_log;
pub mod gemini;
pub mod prompts;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientErrorReason {
    Timeout,
    RateLimited,
    AuthFailure,
    Unknown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason:?}: {message}")]
pub struct ClientError {
    pub reason: ClientErrorReason,
    pub message: String,
}

impl ClientError {
    pub fn new(reason: ClientErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        let reason = if e.is_timeout() {
            ClientErrorReason::Timeout
        } else {
            ClientErrorReason::Unknown
        };
        ClientError::new(reason, e.to_string())
    }
}

/// Request/response client for the external text-generation service.
/// One outstanding request at a time per run; the timeout is per call.
#[async_trait]
pub trait TextGenerationClient: Send + Sync {
    /// Stable backend name, part of the reply cache key.
    fn id(&self) -> &str;

    fn model(&self) -> &str;

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, ClientError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Anthropic Messages API
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicResponse {
    fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
    }
}

/// Wraps the Anthropic Messages API with retry logic.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::builder()
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl TextGenerationClient for AnthropicClient {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, ClientError> {
        let request_body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: prompts::XML_ONLY_SYSTEM,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = send_with_retry(|| {
            self.client
                .post(ANTHROPIC_API_URL)
                .timeout(timeout)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request_body)
        })
        .await?;

        let parsed: AnthropicResponse = response.json().await?;

        debug!(
            "Generation call succeeded: input_tokens={}, output_tokens={}",
            parsed.usage.input_tokens, parsed.usage.output_tokens
        );

        parsed.text().map(str::to_string).ok_or_else(|| {
            ClientError::new(ClientErrorReason::Unknown, "reply has no text content")
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared HTTP plumbing
// ────────────────────────────────────────────────────────────────────────────

/// Error envelope shared by the Anthropic and Gemini APIs.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Sends the request built by `build_request`, retrying on 429, 5xx and
/// transport errors with exponential backoff. Any other non-success status
/// fails immediately.
async fn send_with_retry<F>(build_request: F) -> Result<Response, ClientError>
where
    F: Fn() -> RequestBuilder + Send + Sync,
{
    let mut last_error: Option<ClientError> = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s
            let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
            warn!(
                "Generation call attempt {} failed, retrying after {}ms...",
                attempt,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }

        let response = match build_request().send().await {
            Ok(r) => r,
            Err(e) => {
                last_error = Some(ClientError::from(e));
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = status_error(status, &body);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!("Generation API returned {}: {}", status, body);
            last_error = Some(error);
            continue;
        }
        return Err(error);
    }

    Err(last_error.unwrap_or_else(|| {
        ClientError::new(
            ClientErrorReason::RateLimited,
            format!("rate limited after {MAX_RETRIES} attempts"),
        )
    }))
}

/// Maps a non-success status and its body to a `ClientError`.
fn status_error(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientErrorReason::AuthFailure,
        StatusCode::TOO_MANY_REQUESTS => ClientErrorReason::RateLimited,
        _ => ClientErrorReason::Unknown,
    };
    ClientError::new(reason, format!("status {status}: {message}"))
}

// ────────────────────────────────────────────────────────────────────────────
// Offline client
// ────────────────────────────────────────────────────────────────────────────

static EMPTY_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<field name="([^"]*)">\s*</field>"#).unwrap());

/// Echoes the prompt's target block back, filling every empty field with
/// `Mock content for <field>`.
#[derive(Debug, Clone, Default)]
pub struct DummyClient;

#[async_trait]
impl TextGenerationClient for DummyClient {
    fn id(&self) -> &str {
        "dummy"
    }

    fn model(&self) -> &str {
        "dummy"
    }

    async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, ClientError> {
        // The target block is always the last container in the prompt.
        let start = prompt.rfind("<records").ok_or_else(|| {
            ClientError::new(ClientErrorReason::Unknown, "prompt has no <records> block")
        })?;
        let targets = &prompt[start..];
        Ok(EMPTY_FIELD_RE
            .replace_all(targets, r#"<field name="$1">Mock content for $1</field>"#)
            .into_owned())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Factory
// ────────────────────────────────────────────────────────────────────────────

/// Builds the configured client stack: backend, then the exchange archive,
/// then the reply cache as the outermost layer.
pub fn build_client(
    config: &Config,
    redis: redis::Client,
    s3: aws_sdk_s3::Client,
) -> Arc<dyn TextGenerationClient> {
    let mut client: Arc<dyn TextGenerationClient> = match config.lm_client {
        ClientKind::Anthropic => Arc::new(AnthropicClient::new(
            config.anthropic_api_key.clone().unwrap_or_default(),
            config.lm_model.clone(),
        )),
        ClientKind::Gemini => Arc::new(gemini::GeminiClient::new(
            config.gemini_api_key.clone().unwrap_or_default(),
            config.lm_model.clone(),
        )),
        ClientKind::Dummy => Arc::new(DummyClient),
    };
    info!(
        "Text-generation client initialized (backend: {}, model: {})",
        client.id(),
        client.model()
    );

    if config.log_exchanges {
        client = Arc::new(exchange_log::ArchivedClient::new(
            client,
            s3,
            config.s3_bucket.clone(),
        ));
        info!("Exchange archiving enabled (bucket: {})", config.s3_bucket);
    }

    if config.response_cache_ttl_secs > 0 {
        client = Arc::new(cache::CachedClient::new(
            client,
            redis,
            config.response_cache_ttl_secs,
        ));
        info!(
            "Reply cache enabled (ttl: {}s)",
            config.response_cache_ttl_secs
        );
    }

    client
}
