//! OpenAI-compatible `/chat/completions` client.

use crate::config::InferenceConfig;
use crate::inference::{CompletionBackend, InferenceError, PromptMessage, Sampling};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct CompletionClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl CompletionClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        if api_key.is_none() {
            warn!("No inference API key configured; turn exchanges will fail until one is set");
        }

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete(&self, messages: Vec<PromptMessage>, sampling: Sampling) -> Result<String, InferenceError> {
        let api_key = self.api_key.as_deref().ok_or(InferenceError::MissingApiKey)?;
        let body = ChatRequest {
            model: &self.model,
            messages: &messages,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        };

        let started = Instant::now();
        let res = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = res.json().await?;
        debug!(
            model = %self.model,
            prompt_messages = messages.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Completion received"
        );
        first_choice_text(parsed)
    }
}

fn first_choice_text(response: ChatResponse) -> Result<String, InferenceError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or(InferenceError::EmptyResponse)
}
