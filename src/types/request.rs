//! Canonical request (provider-agnostic chat or completion call)

use super::message::Message;
use super::tool::{FunctionDefinition, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound endpoint shape the caller used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Chat,
    Completion,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Chat => "chat",
            EndpointKind::Completion => "completion",
        }
    }

    /// OpenAI wire path relative to the provider base URL.
    pub fn path(&self) -> &'static str {
        match self {
            EndpointKind::Chat => "chat/completions",
            EndpointKind::Completion => "completions",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either an ordered message list (chat) or a single prompt (completion).
#[derive(Debug, Clone, PartialEq)]
pub enum RequestInput {
    Messages(Vec<Message>),
    Prompt(String),
}

/// Sampling parameters shared by both endpoint shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl SamplingParams {
    pub fn choices(&self) -> u32 {
        self.n.unwrap_or(1)
    }
}

/// Provider-agnostic representation of an inbound call.
///
/// Built by the normalizer; every field has already been validated.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model: String,
    pub input: RequestInput,
    pub params: SamplingParams,
    pub stream: bool,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<Value>,
    pub functions: Option<Vec<FunctionDefinition>>,
    pub function_call: Option<Value>,
    pub user: Option<String>,
}

impl CanonicalRequest {
    pub fn chat(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self::with_input(model, RequestInput::Messages(messages))
    }

    pub fn completion(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_input(model, RequestInput::Prompt(prompt.into()))
    }

    fn with_input(model: impl Into<String>, input: RequestInput) -> Self {
        Self {
            model: model.into(),
            input,
            params: SamplingParams::default(),
            stream: false,
            tools: None,
            tool_choice: None,
            functions: None,
            function_call: None,
            user: None,
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn endpoint(&self) -> EndpointKind {
        match self.input {
            RequestInput::Messages(_) => EndpointKind::Chat,
            RequestInput::Prompt(_) => EndpointKind::Completion,
        }
    }

    pub fn messages(&self) -> Option<&[Message]> {
        match &self.input {
            RequestInput::Messages(m) => Some(m),
            RequestInput::Prompt(_) => None,
        }
    }

    /// True when the call needs tool/function calling semantics end to end.
    pub fn requires_tools(&self) -> bool {
        self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
            || self.functions.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
            || self.tool_choice.is_some()
            || self.function_call.is_some()
            || self
                .messages()
                .map(|m| m.iter().any(Message::uses_tools))
                .unwrap_or(false)
    }

    pub fn contains_image(&self) -> bool {
        self.messages()
            .map(|m| m.iter().any(Message::contains_image))
            .unwrap_or(false)
    }
}
