//! Response shapes: provider-neutral output and the OpenAI-shaped bodies
//! returned to callers.

use super::message::Message;
use super::request::EndpointKind;
use serde::{Deserialize, Serialize};

/// Token counts observed from the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// What a single provider choice carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    Message(Message),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputChoice {
    pub index: u32,
    pub payload: OutputPayload,
    pub finish_reason: Option<String>,
}

/// Complete (non-streaming) provider output after wire decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOutput {
    pub id: Option<String>,
    pub choices: Vec<OutputChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/// `chat.completion` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChoice {
    pub text: String,
    pub index: u32,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<String>,
}

/// `text_completion` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Canonical response in the shape of the endpoint the caller used.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalResponse {
    Chat(ChatCompletion),
    Completion(TextCompletion),
}

impl CanonicalResponse {
    pub fn endpoint(&self) -> EndpointKind {
        match self {
            CanonicalResponse::Chat(_) => EndpointKind::Chat,
            CanonicalResponse::Completion(_) => EndpointKind::Completion,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            CanonicalResponse::Chat(c) => c.usage,
            CanonicalResponse::Completion(c) => c.usage,
        }
    }
}
