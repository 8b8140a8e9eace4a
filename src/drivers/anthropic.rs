//! Anthropic Messages API 客户端：实现 Anthropic 特有的请求/响应格式转换
//!
//! Anthropic Messages API client. Key differences from OpenAI:
//! - System messages are a top-level `system` parameter, not part of `messages`.
//! - Content uses typed blocks: `[{"type": "text", "text": "..."}]`.
//! - Tool calls are `tool_use` blocks; tool results are `tool_result` blocks in a user turn.
//! - Streaming uses `content_block_delta` / `message_delta` / `message_stop` events.
//! - `max_tokens` is required, not optional.
//! - There is no completion endpoint and no `n`.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{
    insert_header, into_provider_response, join_url, malformed, tool_call_json, ProviderClient,
    ProviderRequest, ProviderResponse,
};
use crate::credentials::{Credential, CredentialResolver};
use crate::pipeline::decode::SseFrame;
use crate::transport::HttpTransport;
use crate::types::{
    ContentPart, EndpointKey, Message, MessageContent, MessageRole, ModelDescriptor,
    OutputChoice, OutputPayload, Provider, ProviderEvent, ProviderOutput, RequestInput, Usage,
};
use crate::{Error, Result};

const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug)]
pub struct AnthropicClient {
    model: Arc<ModelDescriptor>,
    transport: HttpTransport,
    credentials: CredentialResolver,
}

impl AnthropicClient {
    pub fn new(
        model: Arc<ModelDescriptor>,
        transport: HttpTransport,
        credentials: CredentialResolver,
    ) -> Self {
        Self {
            model,
            transport,
            credentials,
        }
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION)?;
        match self.credentials.resolve(&self.model.credential).await? {
            Some(Credential::ApiKey(key)) => insert_header(&mut headers, "x-api-key", &key)?,
            Some(Credential::Bearer(token)) => {
                insert_header(&mut headers, "authorization", &format!("Bearer {}", token))?
            }
            None => {}
        }
        Ok(headers)
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn endpoint_key(&self) -> EndpointKey {
        self.model.endpoint_key()
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let body = build_body(request)?;
        let url = join_url(&self.model, "messages")?;
        let headers = self.headers().await?;

        let resp = self
            .transport
            .post_json(url, headers, &body, request.stream)
            .await?;
        let mut parser = FrameParser::default();
        into_provider_response(resp, request.stream, parse_response, move |frame| {
            parser.parse(frame)
        })
        .await
    }
}

/// Messages API body for a chat-shaped request.
pub fn build_body(request: &ProviderRequest) -> Result<Value> {
    let messages = match &request.input {
        RequestInput::Messages(m) => m,
        RequestInput::Prompt(_) => {
            return Err(Error::unsupported(
                "Anthropic models do not serve completion-shaped calls",
            ))
        }
    };
    if request.params.choices() > 1 {
        return Err(Error::unsupported("Anthropic models do not support n > 1"));
    }

    let (system, turns) = split_system_messages(messages)?;
    let mut body = Map::new();
    body.insert("model".into(), Value::String(request.model.clone()));
    body.insert("messages".into(), Value::Array(turns));
    body.insert(
        "max_tokens".into(),
        json!(request.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    body.insert("stream".into(), Value::Bool(request.stream));
    if let Some(sys) = system {
        body.insert("system".into(), Value::String(sys));
    }
    if let Some(t) = request.params.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.params.top_p {
        body.insert("top_p".into(), json!(p));
    }
    if let Some(stop) = &request.params.stop {
        body.insert("stop_sequences".into(), json!(stop));
    }
    if request.params.presence_penalty.is_some()
        || request.params.frequency_penalty.is_some()
        || request.params.seed.is_some()
    {
        debug!("penalties and seed are not supported by Anthropic, dropping them");
    }
    if let Some(user) = &request.user {
        body.insert("metadata".into(), json!({ "user_id": user }));
    }

    let mut tools: Vec<Value> = Vec::new();
    for t in request.tools.iter().flatten() {
        tools.push(tool_json(&t.function.name, &t.function.description, &t.function.parameters));
    }
    for f in request.functions.iter().flatten() {
        tools.push(tool_json(&f.name, &f.description, &f.parameters));
    }
    if !tools.is_empty() {
        body.insert("tools".into(), Value::Array(tools));
    }
    if let Some(choice) = request.tool_choice.as_ref().or(request.function_call.as_ref()) {
        if let Some(mapped) = map_tool_choice(choice) {
            body.insert("tool_choice".into(), mapped);
        }
    }
    Ok(Value::Object(body))
}

fn tool_json(name: &str, description: &Option<String>, parameters: &Option<Value>) -> Value {
    let mut tool = json!({
        "name": name,
        "input_schema": parameters.clone().unwrap_or_else(|| json!({"type": "object"})),
    });
    if let Some(d) = description {
        tool["description"] = Value::String(d.clone());
    }
    tool
}

fn map_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" | "any" => Some(json!({"type": "any"})),
            "none" => Some(json!({"type": "none"})),
            _ => None,
        },
        Value::Object(_) => choice
            .pointer("/function/name")
            .or_else(|| choice.get("name"))
            .and_then(Value::as_str)
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    }
}

/// Extract system messages and convert the rest into Messages API turns.
fn split_system_messages(messages: &[Message]) -> Result<(Option<String>, Vec<Value>)> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut turns: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            MessageRole::System => system_parts.push(m.text()),
            MessageRole::User => turns.push(json!({
                "role": "user",
                "content": content_blocks(m),
            })),
            MessageRole::Assistant => {
                let mut blocks = content_blocks(m);
                for call in m.tool_calls.iter().flatten() {
                    blocks.push(tool_use_block(call)?);
                }
                turns.push(json!({ "role": "assistant", "content": blocks }));
            }
            MessageRole::Tool => turns.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.text(),
                }],
            })),
            MessageRole::Function => {
                return Err(Error::unsupported(
                    "legacy function-role messages are not supported by Anthropic; use tool messages",
                ))
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    Ok((system, turns))
}

fn content_blocks(m: &Message) -> Vec<Value> {
    match &m.content {
        None => Vec::new(),
        Some(MessageContent::Text(s)) if s.is_empty() => Vec::new(),
        Some(MessageContent::Text(s)) => vec![json!({ "type": "text", "text": s })],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::ImageUrl { image_url } => image_block(&image_url.url),
            })
            .collect(),
    }
}

fn image_block(url: &str) -> Value {
    // data:<media>;base64,<payload>
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let media_type = meta.trim_end_matches(";base64");
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

fn tool_use_block(call: &Value) -> Result<Value> {
    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
    let name = call
        .pointer("/function/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_field("messages[].tool_calls[].function.name", "missing"))?;
    let arguments = call
        .pointer("/function/arguments")
        .and_then(Value::as_str)
        .unwrap_or("{}");
    let input: Value = serde_json::from_str(arguments).map_err(|e| {
        Error::invalid_field(
            "messages[].tool_calls[].function.arguments",
            format!("arguments must be a JSON object: {}", e),
        )
    })?;
    Ok(json!({ "type": "tool_use", "id": id, "name": name, "input": input }))
}

fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

fn usage_of(u: &Value) -> Usage {
    Usage::new(
        u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    )
}

/// Parse a non-streaming Messages API response.
pub fn parse_response(body: &Value) -> Result<ProviderOutput> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(Provider::Anthropic, "missing content"))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(tool_call_json(
                    block.get("id").and_then(Value::as_str).unwrap_or_default(),
                    block.get("name").and_then(Value::as_str).unwrap_or_default(),
                    &input.to_string(),
                ));
            }
            _ => {}
        }
    }

    let mut message = Message::assistant(text);
    if !tool_calls.is_empty() {
        if message.text().is_empty() {
            message.content = None;
        }
        message.tool_calls = Some(tool_calls);
    }

    Ok(ProviderOutput {
        id: body.get("id").and_then(Value::as_str).map(String::from),
        choices: vec![OutputChoice {
            index: 0,
            payload: OutputPayload::Message(message),
            finish_reason: body
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(finish_reason),
        }],
        usage: body.get("usage").map(usage_of),
    })
}

/// Messages API stream parser.
///
/// Tool calls are numbered from 0 in the order their `tool_use` blocks open,
/// independent of the content-block index.
#[derive(Debug, Default)]
pub struct FrameParser {
    tool_slots: HashMap<u64, usize>,
}

impl FrameParser {
    fn tool_slot(&mut self, block_index: u64) -> usize {
        let next = self.tool_slots.len();
        *self.tool_slots.entry(block_index).or_insert(next)
    }

    /// Parse one stream event.
    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v: Value =
            serde_json::from_str(&frame.data).map_err(|e| malformed(Provider::Anthropic, e))?;
        let event_type = v.get("type").and_then(Value::as_str).unwrap_or("");
        let block_index = v.get("index").and_then(Value::as_u64).unwrap_or(0);

        let events = match event_type {
            "message_start" => v
                .pointer("/message/usage")
                .map(|u| vec![ProviderEvent::Usage(usage_of(u))])
                .unwrap_or_default(),
            "content_block_start" => {
                let block = v.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let mut call = tool_call_json(
                        block.get("id").and_then(Value::as_str).unwrap_or_default(),
                        block.get("name").and_then(Value::as_str).unwrap_or_default(),
                        "",
                    );
                    call["index"] = json!(self.tool_slot(block_index));
                    vec![ProviderEvent::CallDelta {
                        index: 0,
                        delta: json!({ "tool_calls": [call] }),
                    }]
                } else {
                    Vec::new()
                }
            }
            "content_block_delta" => match v.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => v
                    .pointer("/delta/text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| {
                        vec![ProviderEvent::ContentDelta {
                            index: 0,
                            text: t.to_string(),
                        }]
                    })
                    .unwrap_or_default(),
                Some("input_json_delta") => {
                    let slot = self.tool_slot(block_index);
                    let partial = v
                        .pointer("/delta/partial_json")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    vec![ProviderEvent::CallDelta {
                        index: 0,
                        delta: json!({
                            "tool_calls": [{ "index": slot, "function": { "arguments": partial } }]
                        }),
                    }]
                }
                _ => Vec::new(),
            },
            "message_delta" => {
                let mut events = Vec::new();
                if let Some(u) = v.get("usage") {
                    events.push(ProviderEvent::Usage(usage_of(u)));
                }
                if let Some(r) = v.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    events.push(ProviderEvent::Finish {
                        index: 0,
                        reason: finish_reason(r),
                    });
                }
                events
            }
            "message_stop" => vec![ProviderEvent::Done],
            "error" => {
                let message = v
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream stream error");
                return Err(Error::UpstreamFatal {
                    status: None,
                    attempts: 1,
                    message: message.to_string(),
                });
            }
            // ping, content_block_stop
            _ => Vec::new(),
        };
        Ok(events)
    }
}
