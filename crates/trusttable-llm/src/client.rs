//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint that serves `POST {base_url}/chat/completions`
//! (DeepSeek, OpenAI, vLLM, llama.cpp server).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::model::{CompletionRequest, LanguageModel};

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Model endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Endpoint root, without the `/chat/completions` suffix
    pub base_url: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Bearer token (optional for local servers)
    pub api_key: Option<String>,
    /// Per-request HTTP timeout
    pub request_timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            base_url: std::env::var("TRUSTTABLE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("TRUSTTABLE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: std::env::var("TRUSTTABLE_API_KEY").ok(),
            request_timeout_ms: 60_000,
        }
    }
}

impl ModelConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific endpoint
    pub fn new(base_url: &str, model: &str) -> Self {
        ModelConfig {
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key: None,
            request_timeout_ms: 60_000,
        }
    }

    /// Set the bearer token
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for structured and free-text prompts
pub struct ChatCompletionsClient {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl ChatCompletionsClient {
    /// Create a new client
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("trusttable/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;

        Ok(ChatCompletionsClient {
            config,
            http_client,
        })
    }

    /// Create client from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ModelConfig::from_env())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn build_body<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.user,
        });
        ChatRequest {
            model: &self.config.model,
            messages,
            temperature: request.temperature,
            response_format: request
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
        }
    }
}

fn parse_reply(body: &str) -> Result<String> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| ModelError::Decode(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(ModelError::EmptyResponse)
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = self.build_body(request);
        let mut http = self.http_client.post(self.config.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        debug!(purpose = %request.purpose, model = %self.config.model, "sending completion request");
        let response = http.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }
        parse_reply(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PromptPurpose;

    fn client() -> ChatCompletionsClient {
        ChatCompletionsClient::new(ModelConfig::new("http://localhost:8000/v1/", "test-model"))
            .unwrap()
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            client().config().endpoint(),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn json_mode_sets_response_format() {
        let c = client();
        let req = CompletionRequest::structured(PromptPurpose::Decompose, "be precise", "trace");
        let body = serde_json::to_value(c.build_body(&req)).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "trace");
    }

    #[test]
    fn free_text_omits_response_format_and_empty_system() {
        let c = client();
        let req = CompletionRequest::text(PromptPurpose::Refine, "", "fix it");
        let body = serde_json::to_value(c.build_body(&req)).unwrap();
        assert!(body.get("response_format").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn parses_first_choice_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"42"}}]}"#;
        assert_eq!(parse_reply(body).unwrap(), "42");
    }

    #[test]
    fn empty_choices_are_errors() {
        assert!(matches!(
            parse_reply(r#"{"choices":[]}"#),
            Err(ModelError::EmptyResponse)
        ));
        assert!(matches!(
            parse_reply(r#"{"choices":[{"message":{"content":"  "}}]}"#),
            Err(ModelError::EmptyResponse)
        ));
        assert!(matches!(parse_reply("not json"), Err(ModelError::Decode(_))));
    }
}
