//! 能力适配层：在规范请求与上游线上形状之间转换，必要时执行 chat↔completion 互转
//!
//! Capability adapter.
//!
//! Decides which wire endpoint serves a canonical request given the model's
//! capability set, and converts in both directions:
//!
//! | requested | model exposes | path |
//! |-----------|---------------|------|
//! | chat | chat | [`ConversionPath::Direct`] |
//! | completion | completion | [`ConversionPath::Direct`] |
//! | chat | completion only | [`ConversionPath::ChatToCompletion`] |
//! | completion | chat only | [`ConversionPath::CompletionToChat`] |
//!
//! Every function here is pure; nothing touches the network.

pub mod prompt;

use crate::drivers::ProviderRequest;
use crate::types::{
    Capability, CanonicalRequest, CanonicalResponse, ChatChoice, ChatCompletion, EndpointKind,
    Message, ModelDescriptor, OutputPayload, ProviderEvent, ProviderOutput, RequestInput,
    TextChoice, TextCompletion,
};
use crate::{Error, Result};

/// How a canonical request reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPath {
    Direct,
    /// Chat request flattened into a prompt for a completion-only model.
    ChatToCompletion,
    /// Completion prompt wrapped as a single user message for a chat-only model.
    CompletionToChat,
}

impl ConversionPath {
    pub fn is_conversion(&self) -> bool {
        !matches!(self, ConversionPath::Direct)
    }

    /// Endpoint actually called upstream for a request of `requested` shape.
    pub fn wire_endpoint(&self, requested: EndpointKind) -> EndpointKind {
        match self {
            ConversionPath::Direct => requested,
            ConversionPath::ChatToCompletion => EndpointKind::Completion,
            ConversionPath::CompletionToChat => EndpointKind::Chat,
        }
    }
}

/// Identity fields stamped on a decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    /// Used when the provider did not return an id.
    pub fallback_id: String,
    pub created: i64,
    /// Model name as the caller addressed it.
    pub model: String,
}

fn capability_of(endpoint: EndpointKind) -> Capability {
    match endpoint {
        EndpointKind::Chat => Capability::Chat,
        EndpointKind::Completion => Capability::Completion,
    }
}

/// Pick the conversion path, rejecting requests the model cannot serve.
pub fn plan(request: &CanonicalRequest, model: &ModelDescriptor) -> Result<ConversionPath> {
    let requested = request.endpoint();
    let path = if model.supports(capability_of(requested)) {
        ConversionPath::Direct
    } else {
        match requested {
            EndpointKind::Chat if model.supports(Capability::Completion) => {
                ConversionPath::ChatToCompletion
            }
            EndpointKind::Completion if model.supports(Capability::Chat) => {
                ConversionPath::CompletionToChat
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "model '{}' exposes neither chat nor completion",
                    model.name
                )))
            }
        }
    };

    if path.is_conversion() && request.requires_tools() {
        return Err(Error::unsupported(format!(
            "model '{}' only exposes {}; tool and function calling cannot be converted",
            model.name,
            path.wire_endpoint(requested)
        )));
    }
    if request.contains_image() {
        if path == ConversionPath::ChatToCompletion {
            return Err(Error::unsupported(format!(
                "model '{}' is completion-only; image content cannot be flattened into a prompt",
                model.name
            )));
        }
        if !model.supports(Capability::Vision) {
            return Err(Error::unsupported(format!(
                "model '{}' does not accept image content",
                model.name
            )));
        }
    }
    Ok(path)
}

/// Canonical request to the wire-shaped provider request.
pub fn encode(
    request: &CanonicalRequest,
    model: &ModelDescriptor,
) -> Result<(ConversionPath, ProviderRequest)> {
    let path = plan(request, model)?;
    let input = match (path, &request.input) {
        (ConversionPath::Direct, input) => input.clone(),
        (ConversionPath::ChatToCompletion, RequestInput::Messages(messages)) => {
            RequestInput::Prompt(prompt::flatten(messages))
        }
        (ConversionPath::CompletionToChat, RequestInput::Prompt(p)) => {
            RequestInput::Messages(vec![Message::user(p.clone())])
        }
        // plan() only yields a conversion matching the input shape
        (path, _) => {
            return Err(Error::unsupported(format!(
                "conversion {:?} does not apply to a {} request",
                path,
                request.endpoint()
            )))
        }
    };

    Ok((
        path,
        ProviderRequest {
            model: model.wire_model().to_string(),
            input,
            params: request.params.clone(),
            stream: request.stream,
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            functions: request.functions.clone(),
            function_call: request.function_call.clone(),
            user: request.user.clone(),
        },
    ))
}

/// Provider output back to the shape of the endpoint the caller used.
pub fn decode(
    requested: EndpointKind,
    path: ConversionPath,
    output: ProviderOutput,
    meta: ResponseMeta,
) -> Result<CanonicalResponse> {
    let id = output.id.unwrap_or(meta.fallback_id);
    match requested {
        EndpointKind::Chat => {
            let choices = output
                .choices
                .into_iter()
                .map(|c| {
                    let message = match c.payload {
                        OutputPayload::Message(m) => m,
                        OutputPayload::Text(t) if path == ConversionPath::ChatToCompletion => {
                            prompt::unflatten(t)
                        }
                        OutputPayload::Text(_) => {
                            return Err(Error::UpstreamFatal {
                                status: None,
                                attempts: 1,
                                message: "chat endpoint answered with completion text".into(),
                            })
                        }
                    };
                    Ok(ChatChoice {
                        index: c.index,
                        message,
                        finish_reason: c.finish_reason,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CanonicalResponse::Chat(ChatCompletion {
                id,
                object: "chat.completion".into(),
                created: meta.created,
                model: meta.model,
                choices,
                usage: output.usage,
            }))
        }
        EndpointKind::Completion => {
            let choices = output
                .choices
                .into_iter()
                .map(|c| {
                    let text = match c.payload {
                        OutputPayload::Text(t) => t,
                        OutputPayload::Message(m) => {
                            if m.tool_calls.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
                                || m.function_call.is_some()
                            {
                                return Err(Error::unsupported(
                                    "chat model answered a completion request with a tool call",
                                ));
                            }
                            m.text()
                        }
                    };
                    Ok(TextChoice {
                        text,
                        index: c.index,
                        logprobs: None,
                        finish_reason: c.finish_reason,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CanonicalResponse::Completion(TextCompletion {
                id,
                object: "text_completion".into(),
                created: meta.created,
                model: meta.model,
                choices,
                usage: output.usage,
            }))
        }
    }
}

/// Streaming counterpart of [`decode`].
///
/// Text deltas are shape-neutral. Call deltas can only cross a direct path.
pub fn decode_event(path: ConversionPath, event: ProviderEvent) -> Result<ProviderEvent> {
    match event {
        ProviderEvent::CallDelta { .. } if path.is_conversion() => Err(Error::unsupported(
            "upstream emitted a tool call through a converted endpoint",
        )),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ContentPart, CredentialRef, MessageContent, MessageRole, ModelStatus, OutputChoice,
        Provider, ToolDefinition, Usage,
    };
    use serde_json::json;

    fn model(capabilities: &[Capability]) -> ModelDescriptor {
        ModelDescriptor {
            name: "legacy".into(),
            display_name: "Legacy".into(),
            provider: Provider::OpenAi,
            base_url: url::Url::parse("https://api.example.com/v1").unwrap(),
            capabilities: capabilities.iter().copied().collect(),
            credential: CredentialRef::None,
            status: ModelStatus::Active,
            allowed_groups: Default::default(),
            deployment: None,
            api_version: None,
            upstream_model: Some("davinci-002".into()),
        }
    }

    fn meta() -> ResponseMeta {
        ResponseMeta {
            fallback_id: "gen-1".into(),
            created: 1_700_000_000,
            model: "legacy".into(),
        }
    }

    fn image_message() -> Message {
        let mut m = Message::user("");
        m.content = Some(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this?".into(),
            },
            serde_json::from_value(json!({"type": "image_url", "image_url": {"url": "https://x/y.png"}}))
                .unwrap(),
        ]));
        m
    }

    #[test]
    fn test_direct_paths() {
        let chat = CanonicalRequest::chat("legacy", vec![Message::user("hi")]);
        let (path, wire) = encode(&chat, &model(&[Capability::Chat])).unwrap();
        assert_eq!(path, ConversionPath::Direct);
        assert_eq!(wire.model, "davinci-002");
        assert_eq!(wire.input, chat.input);

        let completion = CanonicalRequest::completion("legacy", "Once");
        let (path, _) = encode(&completion, &model(&[Capability::Completion])).unwrap();
        assert_eq!(path, ConversionPath::Direct);
    }

    #[test]
    fn test_chat_through_completion_only_model() {
        let mut request = CanonicalRequest::chat(
            "legacy",
            vec![
                Message::user("2+2?"),
                Message::system("Answer with a number."),
            ],
        );
        request.params.n = Some(2);
        let (path, wire) = encode(&request, &model(&[Capability::Completion])).unwrap();
        assert_eq!(path, ConversionPath::ChatToCompletion);
        assert_eq!(wire.endpoint(), EndpointKind::Completion);
        assert_eq!(
            wire.input,
            RequestInput::Prompt("System: Answer with a number.\n\nUser: 2+2?\n\nAssistant:".into())
        );
        assert_eq!(wire.params.n, Some(2));

        let output = ProviderOutput {
            id: None,
            choices: vec![OutputChoice {
                index: 0,
                payload: OutputPayload::Text(" 4".into()),
                finish_reason: Some("stop".into()),
            }],
            usage: Some(Usage::new(12, 1)),
        };
        let CanonicalResponse::Chat(chat) = decode(EndpointKind::Chat, path, output, meta()).unwrap()
        else {
            panic!("expected chat response");
        };
        assert_eq!(chat.id, "gen-1");
        assert_eq!(chat.object, "chat.completion");
        assert_eq!(chat.choices.len(), 1);
        assert_eq!(chat.choices[0].message.role, MessageRole::Assistant);
        assert_eq!(chat.choices[0].message.text(), " 4");
        assert_eq!(chat.usage.unwrap().total_tokens, 13);
    }

    #[test]
    fn test_completion_through_chat_only_model() {
        let request = CanonicalRequest::completion("legacy", "Say hi");
        let (path, wire) = encode(&request, &model(&[Capability::Chat])).unwrap();
        assert_eq!(path, ConversionPath::CompletionToChat);
        assert_eq!(
            wire.input,
            RequestInput::Messages(vec![Message::user("Say hi")])
        );

        let output = ProviderOutput {
            id: Some("chatcmpl-9".into()),
            choices: vec![OutputChoice {
                index: 0,
                payload: OutputPayload::Message(Message::assistant("hi")),
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        };
        let CanonicalResponse::Completion(c) =
            decode(EndpointKind::Completion, path, output, meta()).unwrap()
        else {
            panic!("expected completion response");
        };
        assert_eq!(c.id, "chatcmpl-9");
        assert_eq!(c.object, "text_completion");
        assert_eq!(c.choices[0].text, "hi");
    }

    #[test]
    fn test_tools_never_cross_a_conversion() {
        let mut request = CanonicalRequest::chat("legacy", vec![Message::user("weather?")]);
        request.tools = Some(vec![ToolDefinition::function(
            "get_weather",
            None,
            json!({"type": "object"}),
        )]);
        let err = plan(&request, &model(&[Capability::Completion])).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCapability { .. }));

        // tool history alone also requires tools
        let mut tool_turn = Message::new(MessageRole::Tool, "18C");
        tool_turn.tool_call_id = Some("call_1".into());
        let request = CanonicalRequest::chat("legacy", vec![Message::user("x"), tool_turn]);
        assert!(plan(&request, &model(&[Capability::Completion])).is_err());

        // direct path keeps tools
        let mut request = CanonicalRequest::chat("legacy", vec![Message::user("weather?")]);
        request.tool_choice = Some(json!("auto"));
        let (_, wire) = encode(&request, &model(&[Capability::Chat])).unwrap();
        assert_eq!(wire.tool_choice, Some(json!("auto")));
    }

    #[test]
    fn test_image_rules() {
        let request = CanonicalRequest::chat("legacy", vec![image_message()]);
        assert!(plan(&request, &model(&[Capability::Completion])).is_err());
        assert!(plan(&request, &model(&[Capability::Chat])).is_err());
        assert_eq!(
            plan(&request, &model(&[Capability::Chat, Capability::Vision])).unwrap(),
            ConversionPath::Direct
        );
    }

    #[test]
    fn test_no_text_capability() {
        let request = CanonicalRequest::chat("legacy", vec![Message::user("x")]);
        let err = plan(&request, &model(&[Capability::Embeddings])).unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn test_decode_event_rejects_converted_calls() {
        let call = ProviderEvent::CallDelta {
            index: 0,
            delta: json!({"tool_calls": []}),
        };
        assert!(decode_event(ConversionPath::Direct, call.clone()).is_ok());
        assert!(decode_event(ConversionPath::CompletionToChat, call).is_err());
        let text = ProviderEvent::ContentDelta {
            index: 0,
            text: "a".into(),
        };
        assert_eq!(
            decode_event(ConversionPath::ChatToCompletion, text.clone()).unwrap(),
            text
        );
    }
}
