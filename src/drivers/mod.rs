//! Provider 客户端抽象层：每种上游协议一个实现，由工厂按封闭的 Provider 枚举选择
//!
//! Provider clients. One [`ProviderClient`] implementation per upstream wire
//! protocol (OpenAI-compatible, Azure OpenAI, Anthropic Messages), selected by
//! [`DefaultClientFactory`] from the model's [`Provider`]. All of them share
//! the same [`HttpTransport`].
//!
//! A client owns URL layout, authentication headers and the JSON schema of
//! its provider. Shape conversion between chat and completion happens before
//! a request reaches a client.

pub mod anthropic;
pub mod azure;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use azure::AzureOpenAiClient;
pub use openai::OpenAiClient;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::credentials::CredentialResolver;
use crate::pipeline::decode::{SseDecoder, SseFrame};
use crate::transport::HttpTransport;
use crate::types::{
    EndpointKey, EndpointKind, FunctionDefinition, Message, ModelDescriptor, OutputChoice,
    OutputPayload, Provider, ProviderEvent, ProviderOutput, RequestInput, SamplingParams,
    ToolDefinition, Usage,
};
use crate::{BoxStream, Error, ErrorContext, Result};

/// Wire-targeted request handed to a provider client.
///
/// `input` already has the shape of the wire endpoint: messages for chat,
/// a prompt for completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Model id sent upstream.
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

impl ProviderRequest {
    pub fn endpoint(&self) -> EndpointKind {
        match self.input {
            RequestInput::Messages(_) => EndpointKind::Chat,
            RequestInput::Prompt(_) => EndpointKind::Completion,
        }
    }
}

/// What a provider answered with.
pub enum ProviderResponse {
    Complete(ProviderOutput),
    /// Lazy event stream; nothing is read until the consumer polls.
    Stream(BoxStream<'static, ProviderEvent>),
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderResponse::Complete(out) => f.debug_tuple("Complete").field(out).finish(),
            ProviderResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Common send contract implemented once per provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Circuit breaker key for the endpoint this client talks to.
    fn endpoint_key(&self) -> EndpointKey;

    /// Connect, check status, and hand back either the full output or a lazy stream.
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

/// Builds the client for a resolved model.
pub trait ProviderClientFactory: Send + Sync {
    fn create(&self, model: Arc<ModelDescriptor>) -> Result<Arc<dyn ProviderClient>>;
}

/// Factory over the closed [`Provider`] enum, sharing one transport.
#[derive(Debug, Clone)]
pub struct DefaultClientFactory {
    transport: HttpTransport,
    credentials: CredentialResolver,
}

impl DefaultClientFactory {
    pub fn new(transport: HttpTransport, credentials: CredentialResolver) -> Self {
        Self {
            transport,
            credentials,
        }
    }
}

impl ProviderClientFactory for DefaultClientFactory {
    fn create(&self, model: Arc<ModelDescriptor>) -> Result<Arc<dyn ProviderClient>> {
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        Ok(match model.provider {
            Provider::OpenAi => Arc::new(OpenAiClient::new(model, transport, credentials)),
            Provider::AzureOpenAi => Arc::new(AzureOpenAiClient::new(model, transport, credentials)),
            Provider::Anthropic => Arc::new(AnthropicClient::new(model, transport, credentials)),
        })
    }
}

pub(crate) fn malformed(provider: Provider, detail: impl std::fmt::Display) -> Error {
    Error::UpstreamFatal {
        status: None,
        attempts: 1,
        message: format!("malformed {} response: {}", provider, detail),
    }
}

pub(crate) fn header_value(secret: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(secret).map_err(|_| {
        Error::configuration_with_context(
            "credential contains characters not allowed in a header",
            ErrorContext::new().with_source("drivers"),
        )
    })?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: &'static str, secret: &str) -> Result<()> {
    headers.insert(HeaderName::from_static(name), header_value(secret)?);
    Ok(())
}

pub(crate) fn join_url(model: &ModelDescriptor, path: &str) -> Result<url::Url> {
    let raw = format!("{}/{}", model.base(), path.trim_start_matches('/'));
    url::Url::parse(&raw).map_err(|e| {
        Error::configuration_with_context(
            format!("invalid upstream URL: {}", e),
            ErrorContext::new()
                .with_field_path("base_url")
                .with_details(raw),
        )
    })
}

/// Turn a 2xx response into a [`ProviderResponse`].
///
/// A provider that ignores `stream: true` and answers with plain JSON is
/// returned as `Complete`.
pub(crate) async fn into_provider_response<C, F>(
    resp: reqwest::Response,
    stream: bool,
    parse_complete: C,
    parse_frame: F,
) -> Result<ProviderResponse>
where
    C: FnOnce(&Value) -> Result<ProviderOutput>,
    F: FnMut(&SseFrame) -> Result<Vec<ProviderEvent>> + Send + 'static,
{
    let is_event_stream = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);
    if stream && is_event_stream {
        Ok(ProviderResponse::Stream(event_stream(
            HttpTransport::byte_stream(resp),
            parse_frame,
        )))
    } else {
        let body = HttpTransport::read_json(resp).await?;
        Ok(ProviderResponse::Complete(parse_complete(&body)?))
    }
}

/// SSE bytes to provider events, one frame at a time.
pub(crate) fn event_stream<F>(
    bytes: BoxStream<'static, Bytes>,
    mut parse_frame: F,
) -> BoxStream<'static, ProviderEvent>
where
    F: FnMut(&SseFrame) -> Result<Vec<ProviderEvent>> + Send + 'static,
{
    let events = SseDecoder::decode_stream(bytes).flat_map(move |frame| {
        let items: Vec<Result<ProviderEvent>> = match frame.and_then(|f| parse_frame(&f)) {
            Ok(events) => events.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(items)
    });
    Box::pin(events)
}

// ---- OpenAI wire schema, shared by the OpenAI and Azure clients ----

pub(crate) fn openai_body(request: &ProviderRequest, include_model: bool) -> Result<Value> {
    let mut body = Map::new();
    if include_model {
        body.insert("model".into(), Value::String(request.model.clone()));
    }
    match &request.input {
        RequestInput::Messages(messages) => {
            body.insert("messages".into(), serde_json::to_value(messages)?);
        }
        RequestInput::Prompt(prompt) => {
            body.insert("prompt".into(), Value::String(prompt.clone()));
        }
    }
    if let Value::Object(params) = serde_json::to_value(&request.params)? {
        body.extend(params);
    }
    if let Some(tools) = &request.tools {
        body.insert("tools".into(), serde_json::to_value(tools)?);
    }
    if let Some(choice) = &request.tool_choice {
        body.insert("tool_choice".into(), choice.clone());
    }
    if let Some(functions) = &request.functions {
        body.insert("functions".into(), serde_json::to_value(functions)?);
    }
    if let Some(call) = &request.function_call {
        body.insert("function_call".into(), call.clone());
    }
    if let Some(user) = &request.user {
        body.insert("user".into(), Value::String(user.clone()));
    }
    body.insert("stream".into(), Value::Bool(request.stream));
    Ok(Value::Object(body))
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let u = v.get("usage").filter(|u| u.is_object())?;
    let prompt = u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = u
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = u
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

fn choice_index(choice: &Value, position: usize) -> u32 {
    choice
        .get("index")
        .and_then(Value::as_u64)
        .and_then(|i| u32::try_from(i).ok())
        .or_else(|| u32::try_from(position).ok())
        .unwrap_or(u32::MAX)
}

pub(crate) fn parse_openai_response(
    provider: Provider,
    endpoint: EndpointKind,
    body: &Value,
) -> Result<ProviderOutput> {
    let choices = body
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(provider, "missing choices"))?;

    let mut out = Vec::with_capacity(choices.len());
    for (i, choice) in choices.iter().enumerate() {
        let payload = match endpoint {
            EndpointKind::Chat => {
                let raw = choice
                    .get("message")
                    .ok_or_else(|| malformed(provider, "choice without message"))?;
                let message: Message = serde_json::from_value(raw.clone())
                    .map_err(|e| malformed(provider, e))?;
                OutputPayload::Message(message)
            }
            EndpointKind::Completion => OutputPayload::Text(
                choice
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
        };
        out.push(OutputChoice {
            index: choice_index(choice, i),
            payload,
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }

    Ok(ProviderOutput {
        id: body.get("id").and_then(Value::as_str).map(String::from),
        choices: out,
        usage: parse_usage(body),
    })
}

pub(crate) fn parse_openai_frame(
    provider: Provider,
    endpoint: EndpointKind,
    frame: &SseFrame,
) -> Result<Vec<ProviderEvent>> {
    if frame.is_done() {
        return Ok(vec![ProviderEvent::Done]);
    }
    let v: Value = serde_json::from_str(&frame.data).map_err(|e| malformed(provider, e))?;
    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream stream error");
        return Err(Error::UpstreamFatal {
            status: None,
            attempts: 1,
            message: message.to_string(),
        });
    }

    let mut events = Vec::new();
    if let Some(choices) = v.get("choices").and_then(Value::as_array) {
        for (i, choice) in choices.iter().enumerate() {
            let index = choice_index(choice, i);
            let text = match endpoint {
                EndpointKind::Chat => choice.pointer("/delta/content"),
                EndpointKind::Completion => choice.get("text"),
            }
            .and_then(Value::as_str);
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                events.push(ProviderEvent::ContentDelta {
                    index,
                    text: text.to_string(),
                });
            }

            let mut call = Map::new();
            for key in ["tool_calls", "function_call"] {
                if let Some(v) = choice.get("delta").and_then(|d| d.get(key)) {
                    if !v.is_null() {
                        call.insert(key.to_string(), v.clone());
                    }
                }
            }
            if !call.is_empty() {
                events.push(ProviderEvent::CallDelta {
                    index,
                    delta: Value::Object(call),
                });
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                events.push(ProviderEvent::Finish {
                    index,
                    reason: reason.to_string(),
                });
            }
        }
    }
    if let Some(usage) = parse_usage(&v) {
        events.push(ProviderEvent::Usage(usage));
    }
    Ok(events)
}

/// Canonical OpenAI tool-call entry.
pub(crate) fn tool_call_json(id: &str, name: &str, arguments: &str) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": { "name": name, "arguments": arguments },
    })
}
