//! Renders relayed frames as OpenAI-compatible SSE messages.

use serde_json::{json, Map, Value};
use std::collections::HashSet;

use super::relay::RelayFrame;
use crate::types::{EndpointKind, StreamChunk};

/// Terminal data line of a successful stream.
pub const DONE_DATA: &str = "[DONE]";

/// One SSE message, before framing.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseMessage {
    fn data(data: String) -> Self {
        Self { event: None, data }
    }

    /// Wire form, including the blank-line terminator.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Stateful renderer for one response stream.
#[derive(Debug)]
pub struct SseRenderer {
    endpoint: EndpointKind,
    id: String,
    created: i64,
    model: String,
    announced: HashSet<u32>,
}

impl SseRenderer {
    pub fn new(endpoint: EndpointKind, id: String, created: i64, model: String) -> Self {
        Self {
            endpoint,
            id,
            created,
            model,
            announced: HashSet::new(),
        }
    }

    pub fn render(&mut self, frame: &RelayFrame) -> SseMessage {
        match frame {
            RelayFrame::Chunk(chunk) => SseMessage::data(self.chunk_json(chunk).to_string()),
            RelayFrame::Done { .. } => SseMessage::data(DONE_DATA.to_string()),
            RelayFrame::Error(err) => SseMessage {
                event: Some("error"),
                data: json!({
                    "error": {
                        "message": err.to_string(),
                        "type": err.error_code().error_type(),
                        "code": err.wire_code(),
                    }
                })
                .to_string(),
            },
        }
    }

    fn chunk_json(&mut self, chunk: &StreamChunk) -> Value {
        let choice = match self.endpoint {
            EndpointKind::Chat => {
                let mut delta = Map::new();
                // role is announced once per choice
                if self.announced.insert(chunk.choice) {
                    delta.insert("role".into(), json!("assistant"));
                }
                if !chunk.delta.is_empty() {
                    delta.insert("content".into(), json!(chunk.delta));
                }
                if let Some(Value::Object(call)) = &chunk.call_delta {
                    delta.extend(call.clone());
                }
                json!({
                    "index": chunk.choice,
                    "delta": delta,
                    "finish_reason": chunk.finish_reason,
                })
            }
            EndpointKind::Completion => json!({
                "index": chunk.choice,
                "text": chunk.delta,
                "logprobs": null,
                "finish_reason": chunk.finish_reason,
            }),
        };
        let object = match self.endpoint {
            EndpointKind::Chat => "chat.completion.chunk",
            EndpointKind::Completion => "text_completion",
        };
        json!({
            "id": self.id,
            "object": object,
            "created": self.created,
            "model": self.model,
            "choices": [choice],
        })
    }
}
