use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MODEL: &str = "gemini-2.0-flash-exp";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TEMPERATURE: f32 = 0.7;
const MAX_OUTPUT_TOKENS: u32 = 1000;

/// Instruction prefixed to every prompt, matching the provider's expected
/// single-turn format.
const PROMPT_INSTRUCTION: &str =
    "Answer in the same language as the question. Be friendly and helpful. Question: ";

const EMPTY_REPLY: &str = "Sorry, I could not get a response from the AI. Please try again.";

/// Upstream failure, classified for the user. Checked in priority order:
/// 429, then 403, then client-side timeout, then everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiError {
    RateLimited,
    AuthFailure,
    Timeout,
    Upstream(String),
}

impl AiError {
    pub fn user_message(&self) -> &'static str {
        match self {
            AiError::RateLimited => {
                "Too many requests right now. Please wait a moment and try again."
            }
            AiError::AuthFailure => {
                "There is a problem with the API key. Please contact the operator."
            }
            AiError::Timeout => "The request took too long. Please try again.",
            AiError::Upstream(_) => {
                "Something went wrong. Please try rephrasing your question."
            }
        }
    }
}

impl std::fmt::Display for AiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiError::RateLimited => write!(f, "rate limited (HTTP 429)"),
            AiError::AuthFailure => write!(f, "credentials rejected (HTTP 403)"),
            AiError::Timeout => write!(f, "request timed out"),
            AiError::Upstream(detail) => write!(f, "upstream error: {detail}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, api_key })
    }

    /// Asks Gemini a single question. Never fails to its caller: every
    /// upstream failure is mapped to a short user-facing text.
    pub async fn ask(&self, prompt: &str) -> String {
        match self.generate(prompt).await {
            Ok(text) => text,
            Err(err) => {
                error!("Gemini request failed: {err}");
                err.user_message().to_string()
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, AiError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: format!("{PROMPT_INSTRUCTION}{prompt}"),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };

        let url = format!(
            "{GEMINI_API_BASE}/{MODEL}:generateContent?key={}",
            self.api_key
        );

        debug!("Sending request to Gemini ({MODEL})");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Gemini API error ({status}): {body}");
            return Err(classify_status(status));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AiError::Upstream(format!("invalid response body: {e}")))?;

        match extract_text(&body) {
            Some(text) => {
                debug!("Received {} chars from Gemini", text.chars().count());
                Ok(text)
            }
            None => {
                warn!("Gemini returned no candidates");
                Ok(EMPTY_REPLY.to_string())
            }
        }
    }
}

fn classify_transport(err: reqwest::Error) -> AiError {
    if err.is_timeout() {
        AiError::Timeout
    } else {
        AiError::Upstream(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> AiError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AiError::RateLimited,
        StatusCode::FORBIDDEN => AiError::AuthFailure,
        other => AiError::Upstream(format!("HTTP {other}")),
    }
}

/// Text of the first candidate, all parts concatenated. `None` when the
/// provider returned no usable text.
fn extract_text(response: &GenerateResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .map(|part| part.text.as_str())
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
