use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    config::GenerationConfig,
    db::{Message, Persona},
};

use super::prompt::{self, PromptMessage};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation timed out")]
    Timeout,

    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generation service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation service returned an empty reply")]
    EmptyReply,
}

/// Everything the generation service gets to see for one persona turn.
pub struct GenerationRequest<'a> {
    pub persona: &'a Persona,
    /// The message being answered, verbatim.
    pub trigger: &'a Message,
    /// Recent room messages before the trigger, oldest first.
    pub context: &'a [Message],
    /// Display names for the speakers in `trigger` and `context`.
    pub speakers: &'a prompt::Speakers,
    pub deadline: Instant,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, GenerationError>;
}

/// Talks to an OpenAI-compatible `chat/completions` endpoint.
pub struct HttpGenerator {
    http_client: reqwest::Client,
    config: GenerationConfig,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<PromptMessage>,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self, GenerationError> {
        let http_client = reqwest::ClientBuilder::new().build()?;
        Ok(HttpGenerator { http_client, config })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, GenerationError> {
        let remaining = request.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GenerationError::Timeout);
        }

        let body = CompletionRequest {
            model: &self.config.model,
            messages: prompt::build(&request),
            max_tokens: self.config.max_reply_tokens,
        };

        let mut http_request = self.http_client
            .post(format!("{}/chat/completions", self.config.url.trim_end_matches('/')))
            .timeout(remaining)
            .json(&body);
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() { GenerationError::Timeout } else { GenerationError::Http(e) }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status { status: status.as_u16(), body });
        }

        let completion: CompletionResponse = response.json().await?;
        completion.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_owned())
            .filter(|content| !content.is_empty())
            .ok_or(GenerationError::EmptyReply)
    }
}
