//! Anthropic provider implementation over the `/v1/messages` API.

use serde_json::{json, Value};

use super::{
    check_http_response, CompletionRequest, CompletionResponse, LlmProvider, ProviderError,
    TokenUsage,
};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider instance.
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "system": request.system,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(ANTHROPIC_API_BASE)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;

        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let text = parse_content_text(&parsed)?;
        let usage = parse_usage(&parsed);
        let model = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.model)
            .to_owned();

        Ok(CompletionResponse { text, usage, model })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn parse_content_text(value: &Value) -> Result<String, ProviderError> {
    let Some(content_items) = value.get("content").and_then(Value::as_array) else {
        return Err(ProviderError::Parse("missing content array".to_owned()));
    };

    let mut text = String::new();
    for item in content_items {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if item_type == "text" {
            let part = item.get("text").and_then(Value::as_str).unwrap_or_default();
            text.push_str(part);
        }
    }

    Ok(text)
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let input_tokens = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens,
        output_tokens,
    })
}
