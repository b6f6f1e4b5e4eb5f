// OpenAI Protocol enrichment provider
//
// Implements EnrichmentProvider against OpenAI-compatible chat-completion
// APIs. Screenshots travel as image_url content parts with a data URL;
// the model is asked for a bare JSON array per the shared prompt schema.

use async_trait::async_trait;
use procmine_core::llm::{CandidateObject, EnrichmentProvider, EnrichmentRequest, ProviderError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible enrichment provider
///
/// # Example
///
/// ```ignore
/// use procmine_openai::OpenAiEnrichmentProvider;
///
/// let provider = OpenAiEnrichmentProvider::new("your-api-key", "gpt-4o-mini");
/// // or with a custom endpoint
/// let provider = OpenAiEnrichmentProvider::with_base_url("key", "gpt-4o-mini", "https://llm.example/v1/chat/completions");
/// ```
#[derive(Clone)]
pub struct OpenAiEnrichmentProvider {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl OpenAiEnrichmentProvider {
    /// Create a new provider with the given API key and model
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            model: model.into(),
        }
    }

    /// Create a new provider with a custom API URL (for OpenAI-compatible APIs)
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
        let content = match &request.image_base64 {
            Some(image) => json!([
                { "type": "text", "text": request.prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/png;base64,{image}") }
                }
            ]),
            None => json!(request.prompt),
        };
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "temperature": 0.0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl EnrichmentProvider for OpenAiEnrichmentProvider {
    async fn analyze(&self, request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
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
            return Err(classify_status(status.as_u16(), body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ProviderError::Malformed("response has no content".to_string()))?;
        procmine_core::llm::parse_candidates(&text)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::Transient(format!("rate limited: {body}")),
        500..=599 => ProviderError::Transient(format!("server error {status}: {body}")),
        _ => ProviderError::Permanent(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(429, String::new()), ProviderError::Transient(_)));
        assert!(matches!(classify_status(503, String::new()), ProviderError::Transient(_)));
        assert!(matches!(classify_status(401, String::new()), ProviderError::Permanent(_)));
        assert!(matches!(classify_status(400, String::new()), ProviderError::Permanent(_)));
    }

    #[test]
    fn test_body_includes_image_part_when_present() {
        let provider = OpenAiEnrichmentProvider::new("key", "gpt-4o-mini");
        let body = provider.build_body(&EnrichmentRequest {
            prompt: "analyze".to_string(),
            image_base64: Some("AAAA".to_string()),
        });
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"], "image_url");
    }

    #[test]
    fn test_body_uses_plain_text_without_image() {
        let provider = OpenAiEnrichmentProvider::new("key", "gpt-4o-mini");
        let body = provider.build_body(&EnrichmentRequest {
            prompt: "analyze".to_string(),
            image_base64: None,
        });
        assert!(body["messages"][0]["content"].is_string());
    }
}
