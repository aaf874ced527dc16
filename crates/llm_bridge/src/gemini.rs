//! Google Gemini `generateContent` backend
//!
//! Sends the room photo and prompt as inline parts with a JSON
//! response-format hint, and classifies every failure so the
//! orchestrator can decide between backing off, retrying and
//! falling through to the next model.

use crate::backend::{BackendError, GenerateRequest, InferenceBackend, Part};
use crate::config::InferenceTarget;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Configuration for Gemini API client
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API key for Google Gemini
    pub api_key: String,
    /// Endpoint root (default: https://generativelanguage.googleapis.com)
    pub base_url: String,
    /// HTTP client timeout in seconds
    pub timeout_secs: u64,
}

impl GeminiConfig {
    /// Create config from environment variables
    ///
    /// `GEMINI_API_KEY` is required; `GEMINI_BASE_URL` overrides the endpoint.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable not set")?;
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            api_key,
            base_url,
            timeout_secs: 120,
        })
    }
}

/// Gemini API client
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    /// Create client from environment variables
    pub fn from_env() -> Result<Self> {
        let config = GeminiConfig::from_env()?;
        Self::new(config)
    }

    fn url_for(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[async_trait]
impl InferenceBackend for GeminiClient {
    async fn generate_content(
        &self,
        target: &InferenceTarget,
        request: &GenerateRequest,
    ) -> Result<String, BackendError> {
        let body = GeminiRequest::from(request);

        let response = self
            .client
            .post(self.url_for(&target.name))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(
                status.as_u16(),
                error_message(&error_text),
            ));
        }

        let text = response.text().await.map_err(classify_transport_error)?;
        let gemini_response: GeminiResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::fatal(format!("Failed to parse Gemini response: {}", e)))?;

        gemini_response.into_text()
    }
}

fn classify_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_builder() {
        BackendError::fatal(format!("Failed to build Gemini request: {}", error))
    } else {
        BackendError::transient(format!("Failed to reach Gemini API: {}", error))
    }
}

/// Pull `error.message` out of a Gemini error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<GeminiErrorBody>(body)
        .ok()
        .map(|parsed| match parsed.error.status {
            Some(status) => format!("{}: {}", status, parsed.error.message),
            None => parsed.error.message,
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Gemini API request structure
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
}

impl From<&GenerateRequest> for GeminiRequest {
    fn from(request: &GenerateRequest) -> Self {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => GeminiPart::Text { text: text.clone() },
                Part::InlineData { mime_type, data } => GeminiPart::InlineData {
                    inline_data: InlineData {
                        mime_type: mime_type.clone(),
                        data: general_purpose::STANDARD.encode(data),
                    },
                },
            })
            .collect();

        Self {
            contents: vec![GeminiContent { parts }],
            generation_config: request
                .response_mime_type
                .as_ref()
                .map(|mime| GenerationConfig {
                    response_mime_type: mime.clone(),
                }),
        }
    }
}

/// Gemini API response structure
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    status: Option<String>,
}

impl GeminiResponse {
    /// Concatenated text parts of the first candidate
    fn into_text(self) -> Result<String, BackendError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(BackendError::fatal(format!("Prompt blocked by Gemini: {}", reason)));
        }

        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(BackendError::fatal("No candidates in Gemini response"));
        };

        let text: String = candidate
            .content
            .map(|content| content.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| part.text)
            .collect();

        if text.trim().is_empty() {
            return Err(BackendError::fatal(format!(
                "No text in Gemini response (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(text)
    }
}
