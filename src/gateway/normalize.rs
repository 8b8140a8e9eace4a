//! Inbound body validation.
//!
//! Turns a raw JSON body into a [`CanonicalRequest`]. Every rejection is a
//! validation error whose context names the offending field
//! (`messages[2].role`, `temperature`, ...). Unknown fields are ignored.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::types::{
    CanonicalRequest, FunctionDefinition, Message, MessageRole, SamplingParams, ToolDefinition,
};
use crate::{Error, Result};

const MAX_STOP_SEQUENCES: usize = 4;
const MAX_CHOICES: u64 = 128;

/// Body of `POST /v1/chat/completions`.
pub fn normalize_chat(body: &Value) -> Result<CanonicalRequest> {
    let fields = object(body)?;
    let model = model_name(fields)?;

    let raw = match fields.get("messages") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(Error::invalid_field("messages", "must be an array")),
        None => return Err(Error::invalid_field("messages", "is required")),
    };
    if raw.is_empty() {
        return Err(Error::invalid_field("messages", "must not be empty"));
    }
    let mut messages = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        messages.push(message(i, item)?);
    }

    let mut request = CanonicalRequest::chat(model, messages);
    common(fields, &mut request)?;
    request.tools = typed::<Vec<ToolDefinition>>(fields, "tools")?;
    request.tool_choice = fields.get("tool_choice").filter(|v| !v.is_null()).cloned();
    request.functions = typed::<Vec<FunctionDefinition>>(fields, "functions")?;
    request.function_call = fields.get("function_call").filter(|v| !v.is_null()).cloned();
    Ok(request)
}

/// Body of `POST /v1/completions`.
pub fn normalize_completion(body: &Value) -> Result<CanonicalRequest> {
    let fields = object(body)?;
    let model = model_name(fields)?;

    let prompt = match fields.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        // single-element batch form
        Some(Value::Array(items)) if items.len() == 1 => match &items[0] {
            Value::String(s) => s.clone(),
            _ => return Err(Error::invalid_field("prompt[0]", "must be a string")),
        },
        Some(Value::Array(_)) => {
            return Err(Error::invalid_field(
                "prompt",
                "batched prompts are not supported; send one prompt per request",
            ))
        }
        Some(_) => return Err(Error::invalid_field("prompt", "must be a string")),
        None => return Err(Error::invalid_field("prompt", "is required")),
    };
    if prompt.is_empty() {
        return Err(Error::invalid_field("prompt", "must not be empty"));
    }

    let mut request = CanonicalRequest::completion(model, prompt);
    common(fields, &mut request)?;
    Ok(request)
}

fn object(body: &Value) -> Result<&Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| Error::invalid_field("$", "request body must be a JSON object"))
}

fn model_name(fields: &Map<String, Value>) -> Result<String> {
    match fields.get("model") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(Error::invalid_field("model", "must not be empty")),
        Some(_) => Err(Error::invalid_field("model", "must be a string")),
        None => Err(Error::invalid_field("model", "is required")),
    }
}

fn message(i: usize, raw: &Value) -> Result<Message> {
    let path = format!("messages[{}]", i);
    let fields = raw
        .as_object()
        .ok_or_else(|| Error::invalid_field(path.clone(), "must be an object"))?;
    match fields.get("role") {
        Some(Value::String(_)) => {}
        Some(_) => return Err(Error::invalid_field(format!("{}.role", path), "must be a string")),
        None => return Err(Error::invalid_field(format!("{}.role", path), "is required")),
    }
    let m: Message = serde_json::from_value(raw.clone())
        .map_err(|e| Error::invalid_field(path.clone(), e.to_string()))?;

    let needs_content = matches!(
        m.role,
        MessageRole::System | MessageRole::User | MessageRole::Tool
    );
    if needs_content && m.content.is_none() {
        return Err(Error::invalid_field(format!("{}.content", path), "is required"));
    }
    if m.role == MessageRole::Assistant
        && m.content.is_none()
        && m.tool_calls.is_none()
        && m.function_call.is_none()
    {
        return Err(Error::invalid_field(
            format!("{}.content", path),
            "assistant messages need content or a call",
        ));
    }
    if m.role == MessageRole::Tool && m.tool_call_id.is_none() {
        return Err(Error::invalid_field(
            format!("{}.tool_call_id", path),
            "is required for tool messages",
        ));
    }
    Ok(m)
}

fn common(fields: &Map<String, Value>, request: &mut CanonicalRequest) -> Result<()> {
    request.params = SamplingParams {
        temperature: number_in(fields, "temperature", 0.0, 2.0)?,
        max_tokens: integer_in(fields, "max_tokens", 1, u32::MAX as u64)?.map(|v| v as u32),
        top_p: number_in(fields, "top_p", 0.0, 1.0)?,
        stop: stop(fields)?,
        n: integer_in(fields, "n", 1, MAX_CHOICES)?.map(|v| v as u32),
        presence_penalty: number_in(fields, "presence_penalty", -2.0, 2.0)?,
        frequency_penalty: number_in(fields, "frequency_penalty", -2.0, 2.0)?,
        seed: match fields.get("seed") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| Error::invalid_field("seed", "must be an integer"))?,
            ),
        },
    };
    request.stream = match fields.get("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(Error::invalid_field("stream", "must be a boolean")),
    };
    request.user = match fields.get("user") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(Error::invalid_field("user", "must be a string")),
    };
    Ok(())
}

fn number_in(fields: &Map<String, Value>, name: &str, min: f64, max: f64) -> Result<Option<f64>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| Error::invalid_field(name, "must be a number"))?;
            if !(min..=max).contains(&n) {
                return Err(Error::invalid_field(
                    name,
                    format!("must be between {} and {}", min, max),
                ));
            }
            Ok(Some(n))
        }
    }
}

fn integer_in(fields: &Map<String, Value>, name: &str, min: u64, max: u64) -> Result<Option<u64>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_u64()
                .ok_or_else(|| Error::invalid_field(name, "must be a non-negative integer"))?;
            if !(min..=max).contains(&n) {
                return Err(Error::invalid_field(
                    name,
                    format!("must be between {} and {}", min, max),
                ));
            }
            Ok(Some(n))
        }
    }
}

fn stop(fields: &Map<String, Value>) -> Result<Option<Vec<String>>> {
    match fields.get("stop") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
        Some(Value::Array(items)) => {
            if items.len() > MAX_STOP_SEQUENCES {
                return Err(Error::invalid_field(
                    "stop",
                    format!("at most {} stop sequences are allowed", MAX_STOP_SEQUENCES),
                ));
            }
            items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_str()
                        .map(String::from)
                        .ok_or_else(|| Error::invalid_field(format!("stop[{}]", i), "must be a string"))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some)
        }
        Some(_) => Err(Error::invalid_field("stop", "must be a string or an array of strings")),
    }
}

fn typed<T: DeserializeOwned>(fields: &Map<String, Value>, name: &str) -> Result<Option<T>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| Error::invalid_field(name, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestInput;
    use serde_json::json;

    fn field_path(err: &Error) -> Option<&str> {
        err.context().and_then(|c| c.field_path.as_deref())
    }

    #[test]
    fn test_chat_body() {
        let req = normalize_chat(&json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": [{"type": "text", "text": "Hi"}]}
            ],
            "temperature": 0.2,
            "max_tokens": 64,
            "stop": "END",
            "stream": true,
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {"type": "object"}}}],
            "tool_choice": "auto",
            "user": "u-1",
            "logit_bias": {}
        }))
        .unwrap();
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.messages().unwrap().len(), 2);
        assert_eq!(req.params.temperature, Some(0.2));
        assert_eq!(req.params.max_tokens, Some(64));
        assert_eq!(req.params.stop, Some(vec!["END".to_string()]));
        assert!(req.stream);
        assert!(req.requires_tools());
        assert_eq!(req.user.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_chat_rejections() {
        let cases = [
            (json!({"messages": [{"role": "user", "content": "x"}]}), "model"),
            (json!({"model": "", "messages": [{"role": "user", "content": "x"}]}), "model"),
            (json!({"model": "m", "messages": []}), "messages"),
            (json!({"model": "m"}), "messages"),
            (json!({"model": "m", "messages": [{"content": "x"}]}), "messages[0].role"),
            (json!({"model": "m", "messages": [{"role": "wizard", "content": "x"}]}), "messages[0]"),
            (json!({"model": "m", "messages": [{"role": "user"}]}), "messages[0].content"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "temperature": 3}), "temperature"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "top_p": "high"}), "top_p"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "n": 0}), "n"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "max_tokens": 0}), "max_tokens"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "stop": ["a","b","c","d","e"]}), "stop"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "stop": [1]}), "stop[0]"),
            (json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "stream": "yes"}), "stream"),
            (json!({"model": "m", "messages": [{"role": "tool", "content": "x"}]}), "messages[0].tool_call_id"),
        ];
        for (body, path) in cases {
            let err = normalize_chat(&body).unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{body}");
            assert_eq!(field_path(&err), Some(path), "{body}");
        }
        assert!(normalize_chat(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_completion_body() {
        let req = normalize_completion(&json!({"model": "davinci", "prompt": ["Once"], "n": 2})).unwrap();
        assert_eq!(req.input, RequestInput::Prompt("Once".into()));
        assert_eq!(req.params.n, Some(2));
        assert!(!req.stream);

        let err = normalize_completion(&json!({"model": "davinci", "prompt": ""})).unwrap_err();
        assert_eq!(field_path(&err), Some("prompt"));
        let err = normalize_completion(&json!({"model": "davinci", "prompt": ["a", "b"]})).unwrap_err();
        assert_eq!(field_path(&err), Some("prompt"));
        let err = normalize_completion(&json!({"model": "davinci"})).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }
}
