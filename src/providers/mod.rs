//! LLM provider abstraction layer.
//!
//! The strategic planner treats the model as a creative proposer behind a
//! single asynchronous text-in/text-out call. One provider is implemented:
//! [`anthropic::AnthropicProvider`] over the `/v1/messages` API. All
//! adaptive intelligence lives in the planner's deterministic
//! post-validation; a provider failure is always recoverable.

use async_trait::async_trait;
use regex::Regex;

pub mod anthropic;

/// A request for one completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt (tool catalogue, safety rules, output schema).
    pub system: String,
    /// User prompt for the current phase or adaptation.
    pub prompt: String,
    /// Maximum tokens in the response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: Option<f64>,
}

/// Token usage statistics for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
}

/// The response from a provider.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Concatenated response text.
    pub text: String,
    /// Token usage when the provider reports it.
    pub usage: Option<TokenUsage>,
    /// Model identifier that served the response.
    pub model: String,
}

/// Errors returned by model providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream provider responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// No provider is configured.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Core LLM provider interface.
///
/// Implementations must be `Send + Sync` so the planner can be shared
/// across workflow tasks.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request a completion.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on API, network, or parse failure.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// The model identifier string this provider is instantiated for.
    fn model_id(&self) -> &str;
}

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure,
/// `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace, scrub credential-shaped substrings, and truncate.
///
/// Error bodies can echo request headers; keys must never reach logs.
fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"xoxb-[A-Za-z0-9\-]{20,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}
