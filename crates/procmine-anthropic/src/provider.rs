// Anthropic enrichment provider
//
// Implements EnrichmentProvider against the Messages API. Screenshots
// travel as base64 image source blocks.

use async_trait::async_trait;
use procmine_core::llm::{CandidateObject, EnrichmentProvider, EnrichmentRequest, ProviderError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

/// Anthropic Claude enrichment provider
#[derive(Clone)]
pub struct AnthropicEnrichmentProvider {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl AnthropicEnrichmentProvider {
    /// Create a new provider with the given API key and model
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            model: model.into(),
        }
    }

    /// Create a new provider with a custom API URL
    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
            model: model.into(),
        }
    }

    fn build_body(&self, request: &EnrichmentRequest) -> Value {
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        if let Some(image) = &request.image_base64 {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": "image/png",
                    "data": image,
                }
            }));
        }
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{ "role": "user", "content": content }],
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl EnrichmentProvider for AnthropicEnrichmentProvider {
    async fn analyze(&self, request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::Transient(format!("rate limited: {body}")),
                500..=599 => ProviderError::Transient(format!("server error {status}: {body}")),
                _ => ProviderError::Permanent(format!("status {status}: {body}")),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let text = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::Malformed("response has no text blocks".to_string()));
        }
        procmine_core::llm::parse_candidates(&text)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_shape() {
        let provider = AnthropicEnrichmentProvider::new("key", "claude-3-5-haiku-latest");
        let body = provider.build_body(&EnrichmentRequest {
            prompt: "analyze".to_string(),
            image_base64: Some("AAAA".to_string()),
        });
        assert_eq!(body["max_tokens"], json!(MAX_TOKENS));
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["source"]["type"], "base64");
    }
}
