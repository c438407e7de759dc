//! OpenAI-compatible chat completion client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::WorkerError;

use super::ChatModel;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// [`ChatModel`] backed by an OpenAI-compatible `/chat/completions`
/// endpoint
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn complete(&self, prompt: &str) -> Result<String, WorkerError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            // Evaluations should be reproducible
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| WorkerError::transient(format!("Chat request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(WorkerError::transient(format!(
                "Chat endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(WorkerError::terminal(format!(
                "Chat endpoint returned {}",
                status
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::terminal(format!("Malformed chat response: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(WorkerError::terminal(
                "Chat response contained no content".to_string(),
            ));
        }

        Ok(content)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
