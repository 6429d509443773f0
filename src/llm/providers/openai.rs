use crate::config::BackendConfig;
use crate::llm::{ChatClient, ChatReply, ClientSettings, LlmError, TEMPERATURE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Client for an OpenAI-compatible `/chat/completions` endpoint (vLLM, etc.).
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    chat_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize, Debug)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Debug)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(backend: &BackendConfig, settings: &ClientSettings) -> Result<Self, LlmError> {
        if backend.endpoint.trim().is_empty() {
            return Err(LlmError::ConfigError(format!(
                "backend '{}' has no endpoint",
                backend.key
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            chat_url: format!("{}/chat/completions", backend.endpoint.trim_end_matches('/')),
            api_key: backend.api_key.clone(),
            model: backend.model.clone(),
            max_tokens: settings.max_tokens,
        })
    }
}

fn classify_send_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else {
        LlmError::ConnectionError(e.to_string())
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<ChatReply, LlmError> {
        let request = PromptRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: system_prompt.to_string(),
                },
                Message {
                    role: "user",
                    content: user_message.to_string(),
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: self.max_tokens,
        };

        debug!("Sending chat completion to {} with model {}", self.chat_url, self.model);

        let mut builder = self.client.post(&self.chat_url).json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(classify_send_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            error!("API responded with status code: {} - {}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {}",
                status
            )));
        }

        let prompt_response: PromptResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(e.to_string())
            } else {
                LlmError::ResponseError(e.to_string())
            }
        })?;

        let Some(choice) = prompt_response.choices.into_iter().next() else {
            return Err(LlmError::ResponseError("No choices in response".to_string()));
        };

        let message = choice.message;
        Ok(ChatReply {
            content: message.content.unwrap_or_default(),
            reasoning: message
                .reasoning_content
                .or(message.reasoning)
                .unwrap_or_default(),
        })
    }
}
