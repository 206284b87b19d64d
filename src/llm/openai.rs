/// OpenAI chat-completions backend for code generation and failure analysis
///
/// The prompt already carries the full correction context; this client only
/// ships it, waits, and parses the answer.
use super::{parse_generated, CodeGenerator, GeneratedCode, GenerationError};
use crate::improvement::analysis::{analysis_prompt, parse_analysis, FailureAnalysis, FailureAnalyzer};
use crate::improvement::prompt::FailureContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const MAX_TOKENS: u32 = 3000;
const ANALYSIS_MAX_TOKENS: u32 = 2000;
const ANALYSIS_TEMPERATURE: f32 = 0.1;
const RATE_LIMIT_DELAY_MS: u64 = 2500;
const MAX_RATE_LIMIT_RETRIES: u32 = 2; // only 429s are retried here

const SYSTEM_PROMPT: &str = "You are a Bitcoin prediction algorithm improvement specialist. \
You write small, dependency-free Python 3 modules. Respond with valid JSON only, no markdown formatting.";

const ANALYSIS_SYSTEM_PROMPT: &str = "You are an expert in Bitcoin technical analysis and trading algorithms. \
Explain why predictions failed. Respond with valid JSON only, no markdown formatting.";

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: Option<String>,
}

pub struct OpenAiClient {
    api_key: String,
    api_url: String,
    model: String,
    temperature: f32,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            api_url: OPENAI_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2, // a little room to rewrite, still mostly deterministic
            request_timeout: Duration::from_secs(120),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn build_request(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> OpenAIRequest {
        OpenAIRequest {
            model: self.model.clone(),
            max_tokens,
            temperature,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
        }
    }

    /// One chat completion, retrying 429s only
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GenerationError> {
        let request = self.build_request(system, prompt, temperature, max_tokens);
        let mut retry_count = 0;

        loop {
            let response = self
                .client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", &self.api_key))
                .header("content-type", "application/json")
                .timeout(self.request_timeout)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        GenerationError::Timeout(self.request_timeout)
                    } else {
                        GenerationError::Request(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();

                if status.as_u16() == 429 {
                    retry_count += 1;
                    if retry_count > MAX_RATE_LIMIT_RETRIES {
                        return Err(GenerationError::RateLimited(body));
                    }
                    let delay_ms = RATE_LIMIT_DELAY_MS * 2_u64.pow(retry_count - 1);
                    tracing::warn!(
                        "OpenAI rate limited, backing off {}ms (retry {}/{})",
                        delay_ms,
                        retry_count,
                        MAX_RATE_LIMIT_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    continue;
                }

                return Err(GenerationError::Api {
                    status: status.as_u16(),
                    body,
                });
            }

            let openai_response: OpenAIResponse = response
                .json()
                .await
                .map_err(|e| GenerationError::Malformed(format!("JSON decode error: {}", e)))?;

            let text = openai_response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| GenerationError::Malformed("response has no choices".to_string()))?;

            tracing::debug!(chars = text.len(), model = %self.model, "received completion");

            return Ok(text);
        }
    }
}

#[async_trait]
impl CodeGenerator for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<GeneratedCode, GenerationError> {
        let text = self
            .complete(SYSTEM_PROMPT, prompt, self.temperature, MAX_TOKENS)
            .await?;
        parse_generated(&text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl FailureAnalyzer for OpenAiClient {
    async fn analyze(&self, context: &FailureContext) -> Result<FailureAnalysis, GenerationError> {
        let text = self
            .complete(
                ANALYSIS_SYSTEM_PROMPT,
                &analysis_prompt(context),
                ANALYSIS_TEMPERATURE,
                ANALYSIS_MAX_TOKENS,
            )
            .await?;
        parse_analysis(&text, context, &self.model)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
