use crate::error::ProviderError;
use crate::llm::registry::LlmProfile;
use crate::llm::{classify_status, classify_transport, http_client, LlmProvider};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Anthropic messages API client.
pub struct AnthropicProvider {
    model: String,
    endpoint: String,
    temperature: f32,
    max_tokens: u32,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_profile(profile: &LlmProfile, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = profile
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Permanent("Anthropic API key not provided".to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|e| ProviderError::Permanent(format!("invalid Anthropic API key: {}", e)))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let base_url = profile.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Ok(Self {
            model: profile.model.clone(),
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
            headers,
            client: http_client("Anthropic", timeout)?,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock { kind: "text", text: prompt }],
            }],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("Anthropic", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status("Anthropic", status, &text));
        }
        let parsed: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("failed to parse Anthropic response: {}", e)))?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.trim().is_empty() {
            return Err(ProviderError::Permanent("Anthropic response missing text content".to_string()));
        }
        Ok(answer)
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
