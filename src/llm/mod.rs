// LLM collaborator: turns correction prompts into candidate predictor code
// and failed predictions into diagnoses
pub mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Why the LLM did not hand back usable code
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum GenerationError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed LLM response: {0}")]
    Malformed(String),
}

/// Candidate code plus whatever the model said about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
    pub description: Option<String>,
    #[serde(default)]
    pub changes_made: Vec<String>,
}

impl GeneratedCode {
    pub fn from_code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: None,
            changes_made: Vec::new(),
        }
    }
}

/// Anything that can answer a correction prompt with code
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// One call, no retries beyond what the backend itself does
    async fn generate(&self, prompt: &str) -> Result<GeneratedCode, GenerationError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct ImprovementResponse {
    improved_code: String,
    #[serde(default)]
    improvement_description: Option<String>,
    #[serde(default)]
    changes_made: Vec<String>,
}

/// Strip a leading/trailing markdown fence (```json, ```python, ```)
pub(crate) fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }

    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => return "",
    };
    body.trim_end().trim_end_matches("```").trim_end()
}

/// First ```python block anywhere in the text, else the first bare ``` block
fn extract_python_block(text: &str) -> Option<&str> {
    let mut bare = None;
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_ticks = &rest[open + 3..];
        let newline = after_ticks.find('\n')?;
        let tag = after_ticks[..newline].trim();
        let body = &after_ticks[newline + 1..];
        let close = body.find("```")?;

        match tag {
            "python" | "py" | "python3" => return Some(&body[..close]),
            "" if bare.is_none() => bare = Some(&body[..close]),
            _ => {}
        }
        rest = &body[close + 3..];
    }

    bare
}

impl TryFrom<ImprovementResponse> for GeneratedCode {
    type Error = GenerationError;

    fn try_from(response: ImprovementResponse) -> Result<Self, Self::Error> {
        if response.improved_code.trim().is_empty() {
            return Err(GenerationError::Malformed(
                "improved_code is empty".to_string(),
            ));
        }
        Ok(GeneratedCode {
            code: response.improved_code,
            description: response.improvement_description,
            changes_made: response.changes_made,
        })
    }
}

/// Parse a chat completion into candidate code
///
/// Accepts the requested JSON object (optionally fenced) or a bare python block.
pub fn parse_generated(text: &str) -> Result<GeneratedCode, GenerationError> {
    let unfenced = strip_fences(text);

    if let Ok(response) = serde_json::from_str::<ImprovementResponse>(unfenced) {
        return response.try_into();
    }

    // Some models wrap the JSON in prose; try the outermost braces
    if let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) {
        if open < close {
            if let Ok(response) = serde_json::from_str::<ImprovementResponse>(&text[open..=close])
            {
                return response.try_into();
            }
        }
    }

    if let Some(block) = extract_python_block(text) {
        if !block.trim().is_empty() {
            return Ok(GeneratedCode::from_code(block));
        }
    }

    let preview: String = text.chars().take(200).collect();
    Err(GenerationError::Malformed(format!(
        "no JSON object or python block found (text: {})",
        preview
    )))
}
