//! Streaming events: what drivers emit and what the relay forwards.

use super::response::Usage;
use serde_json::Value;

/// Provider-neutral streaming event produced by a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Text delta for choice `index`.
    ContentDelta { index: u32, text: String },

    /// Partial call payload: an object holding `tool_calls` or `function_call`
    /// in OpenAI delta shape, merged as-is into the relayed delta.
    CallDelta { index: u32, delta: Value },

    /// Choice `index` finished.
    Finish { index: u32, reason: String },

    /// Token counts seen so far; later reports supersede earlier ones field by field.
    Usage(Usage),

    /// Upstream end-of-stream marker.
    Done,
}

/// One sequenced delta relayed to the caller.
///
/// `sequence` starts at 0 and increases by one per chunk of a healthy stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub sequence: u64,
    pub choice: u32,
    pub delta: String,
    pub call_delta: Option<Value>,
    pub finish_reason: Option<String>,
}
