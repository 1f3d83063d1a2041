use std::ops::AddAssign;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LlmBackend;
use crate::error::LlmError;

/// What an upstream call is for. Used for logging and by scripted backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Questions,
    Plan,
    Search,
    Evaluate,
    FollowUp,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Developer,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputMessage {
    pub role: Role,
    pub content: String,
}

impl InputMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub kind: CallKind,
    pub model: String,
    pub instructions: Option<String>,
    pub input: Vec<InputMessage>,
    pub web_search: bool,
    pub previous_response_id: Option<String>,
}

impl LlmRequest {
    pub fn new(kind: CallKind, model: &str, input: Vec<InputMessage>) -> Self {
        Self {
            kind,
            model: model.to_string(),
            instructions: None,
            input,
            web_search: false,
            previous_response_id: None,
        }
    }

    pub fn instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }

    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }

    pub fn chained_to(mut self, response_id: Option<&str>) -> Self {
        self.previous_response_id = response_id.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// One `output_text` part of a response, with its annotations left untyped.
///
/// Annotations are parsed later by whoever needs them, so a malformed one
/// never fails the whole response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextSegment {
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub id: String,
    pub text: String,
    pub segments: Vec<TextSegment>,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn from_segments(id: impl Into<String>, segments: Vec<TextSegment>, usage: TokenUsage) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        Self {
            id: id.into(),
            text,
            segments,
            usage,
        }
    }
}

// Responses API wire format

#[derive(Debug, Clone, Serialize)]
struct Tool {
    #[serde(rename = "type")]
    tool_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    input: &'a [InputMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiResponse {
    id: String,
    #[serde(default)]
    output: Vec<OutputItem>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText(TextSegment),
    #[serde(other)]
    Other,
}

impl ApiResponse {
    fn into_llm_response(self) -> LlmResponse {
        let segments = self
            .output
            .into_iter()
            .filter_map(|item| match item {
                OutputItem::Message { content } => Some(content),
                OutputItem::Other => None,
            })
            .flatten()
            .filter_map(|part| match part {
                OutputContent::OutputText(segment) => Some(segment),
                OutputContent::Other => None,
            })
            .collect();
        LlmResponse::from_segments(self.id, segments, self.usage.unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn respond(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let tools = if request.web_search {
            vec![Tool { tool_type: "web_search" }]
        } else {
            Vec::new()
        };
        let body = ApiRequest {
            model: &request.model,
            instructions: request.instructions.as_deref(),
            input: &request.input,
            tools,
            previous_response_id: request.previous_response_id.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let api_response: ApiResponse =
            serde_json::from_slice(&bytes).map_err(|e| LlmError::Decode(e.to_string()))?;

        Ok(api_response.into_llm_response())
    }
}
