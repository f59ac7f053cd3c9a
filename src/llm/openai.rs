use crate::error::ProviderError;
use crate::llm::registry::LlmProfile;
use crate::llm::{classify_status, classify_transport, http_client, LlmProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = "You are an expert SQL writer who converts natural language questions into SQL.";

/// OpenAI chat completions client.
pub struct OpenAiProvider {
    api_key: String,
    model: String,
    endpoint: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn from_profile(profile: &LlmProfile, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = profile
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Permanent("OpenAI API key not provided".to_string()))?;
        let base_url = profile.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Ok(Self {
            api_key,
            model: profile.model.clone(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
            client: http_client("OpenAI", timeout)?,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("OpenAI", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status("OpenAI", status, &text));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("failed to parse OpenAI response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::Permanent("OpenAI response missing message content".to_string()))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
