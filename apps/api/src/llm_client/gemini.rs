/// Google Gemini `generateContent` backend.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{prompts, send_with_retry, ClientError, ClientErrorReason, TextGenerationClient};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

impl<'a> GeminiContent<'a> {
    fn text(text: &'a str) -> Self {
        Self {
            parts: vec![GeminiPart { text }],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GeminiResponse {
    /// Text of the first part of the first candidate.
    fn into_text(self) -> Result<String, ClientError> {
        let candidate = self.candidates.into_iter().next().ok_or_else(|| {
            ClientError::new(ClientErrorReason::Unknown, "reply has no candidates")
        })?;
        candidate
            .content
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| {
                ClientError::new(ClientErrorReason::Unknown, "reply has no text content")
            })
    }
}

/// Wraps the Gemini API with the same retry policy as the Anthropic client.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::builder()
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
            model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{GEMINI_API_BASE}/{}:generateContent", self.model)
    }
}

#[async_trait]
impl TextGenerationClient for GeminiClient {
    fn id(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, ClientError> {
        let request_body = GeminiRequest {
            system_instruction: GeminiContent::text(prompts::XML_ONLY_SYSTEM),
            contents: vec![GeminiContent::text(prompt)],
        };
        let url = self.endpoint();

        let response = send_with_retry(|| {
            self.client
                .post(&url)
                .timeout(timeout)
                .header("x-goog-api-key", &self.api_key)
                .header("content-type", "application/json")
                .json(&request_body)
        })
        .await?;

        let parsed: GeminiResponse = response.json().await?;
        if let Some(usage) = &parsed.usage_metadata {
            debug!(
                "Generation call succeeded: input_tokens={}, output_tokens={}",
                usage.prompt_token_count, usage.candidates_token_count
            );
        }

        parsed.into_text()
    }
}
