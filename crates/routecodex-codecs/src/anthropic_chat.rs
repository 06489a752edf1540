use serde_json::{json, Value};

use routecodex_core::error::{ConversionFailureKind, Result, RouteCodexError};

use crate::tooling::sanitize_tool_name;

fn schema_violation(detail: impl Into<String>) -> RouteCodexError {
    RouteCodexError::ConversionFailed { kind: ConversionFailureKind::SchemaViolation, detail: detail.into() }
}

/// Collapses an Anthropic `content[]` array of text blocks into a single
/// string (spec §4.3.1). Non-text blocks are handled by the caller before
/// this runs.
fn collapse_text_blocks(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    block.get("text").and_then(|t| t.as_str()).map(str::to_string)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Converts an Anthropic Messages request body into an OpenAI-Chat request
/// body (spec §4.3.1). `system` is hoisted into a leading system message;
/// `tool_use`/`tool_result` blocks become `assistant.tool_calls[]` and
/// `{role:"tool"}` messages respectively; tool definitions drop `$schema`.
pub fn anthropic_request_to_chat(anthropic: &Value) -> Result<Value> {
    let mut messages = Vec::new();

    if let Some(system) = anthropic.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            other => collapse_text_blocks(other),
        };
        if !text.is_empty() {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    let source_messages = anthropic
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| schema_violation("anthropic request missing 'messages' array"))?;

    for message in source_messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let content = message.get("content").cloned().unwrap_or(Value::Null);

        match &content {
            Value::Array(blocks) => {
                let mut tool_calls = Vec::new();
                let mut tool_results = Vec::new();
                let text = collapse_text_blocks(&content);

                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("tool_use") => {
                            let name = sanitize_tool_name(
                                block.get("name").and_then(|v| v.as_str()).unwrap_or("tool"),
                            );
                            let arguments = block
                                .get("input")
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "{}".to_string());
                            tool_calls.push(json!({
                                "id": block.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
                                "type": "function",
                                "function": { "name": name, "arguments": arguments },
                            }));
                        }
                        Some("tool_result") => {
                            let tool_content = block
                                .get("content")
                                .map(collapse_or_passthrough)
                                .unwrap_or_default();
                            tool_results.push(json!({
                                "role": "tool",
                                "tool_call_id": block.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or_default(),
                                "content": tool_content,
                            }));
                        }
                        _ => {}
                    }
                }

                if !text.is_empty() || !tool_calls.is_empty() {
                    let mut entry = json!({ "role": role, "content": if text.is_empty() { Value::Null } else { Value::String(text) } });
                    if !tool_calls.is_empty() {
                        entry["tool_calls"] = Value::Array(tool_calls);
                    }
                    messages.push(entry);
                }
                messages.extend(tool_results);
            }
            Value::String(text) => {
                messages.push(json!({ "role": role, "content": text }));
            }
            _ => {}
        }
    }

    let mut chat = json!({ "model": anthropic.get("model").cloned().unwrap_or(Value::Null), "messages": messages });

    if let Some(tools) = anthropic.get("tools").and_then(|t| t.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut parameters = tool.get("input_schema").cloned().unwrap_or(json!({}));
                if let Some(obj) = parameters.as_object_mut() {
                    obj.remove("$schema");
                }
                json!({
                    "type": "function",
                    "function": {
                        "name": sanitize_tool_name(tool.get("name").and_then(|v| v.as_str()).unwrap_or("tool")),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": parameters,
                    }
                })
            })
            .collect();
        if !converted.is_empty() {
            chat["tools"] = Value::Array(converted);
            if anthropic.get("tool_choice").is_none() {
                chat["tool_choice"] = Value::String("auto".to_string());
            } else {
                chat["tool_choice"] = anthropic["tool_choice"].clone();
            }
        }
    }

    if let Some(max_tokens) = anthropic.get("max_tokens") {
        chat["max_tokens"] = max_tokens.clone();
    }
    if let Some(stream) = anthropic.get("stream") {
        chat["stream"] = stream.clone();
    }

    Ok(chat)
}

fn collapse_or_passthrough(content: &Value) -> Value {
    match content {
        Value::String(_) => content.clone(),
        Value::Array(_) => Value::String(collapse_text_blocks(content)),
        other => other.clone(),
    }
}

fn map_finish_reason(finish_reason: Option<&str>, has_tool_calls: bool) -> &'static str {
    match finish_reason {
        Some("tool_calls") => "tool_use",
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        _ if has_tool_calls => "tool_use",
        _ => "end_turn",
    }
}

/// Converts an OpenAI-Chat response back into an Anthropic Messages
/// response (spec §4.3.1): one `text` block for textual content, one
/// `tool_use` block per `tool_calls[]` entry, and a mapped `stop_reason`.
pub fn chat_response_to_anthropic(chat: &Value) -> Result<Value> {
    let choice = chat
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| schema_violation("chat response missing 'choices[0]'"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| schema_violation("chat response missing 'choices[0].message'"))?;

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }

    let tool_calls = message.get("tool_calls").and_then(|t| t.as_array()).cloned().unwrap_or_default();
    for call in &tool_calls {
        let arguments_raw = call.pointer("/function/arguments").and_then(|v| v.as_str()).unwrap_or("{}");
        let input: Value = serde_json::from_str(arguments_raw).map_err(|e| RouteCodexError::ConversionFailed {
            kind: ConversionFailureKind::ParseError,
            detail: format!("tool_calls[].function.arguments not valid JSON: {e}"),
        })?;
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
            "name": call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or_default(),
            "input": input,
        }));
    }

    let stop_reason = map_finish_reason(choice.get("finish_reason").and_then(|v| v.as_str()), !tool_calls.is_empty());

    Ok(json!({
        "role": "assistant",
        "content": content,
        "stop_reason": stop_reason,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_one_request_side() {
        let anthropic = json!({
            "model": "glm-4.6",
            "messages": [{"role":"user","content":[{"type":"text","text":"hi"}]}],
            "tools": [{"name":"shell","input_schema":{"type":"object","properties":{"command":{"type":"array","items":{"type":"string"}}},"required":["command"]}}]
        });
        let chat = anthropic_request_to_chat(&anthropic).unwrap();
        assert_eq!(chat["messages"][0]["content"], "hi");
        assert_eq!(chat["tools"][0]["function"]["name"], "shell");
        assert!(chat["tools"][0]["function"]["parameters"].get("$schema").is_none());
        assert_eq!(chat["tool_choice"], "auto");
    }

    #[test]
    fn scenario_one_response_side() {
        let chat = json!({
            "choices": [{
                "message": { "tool_calls": [{"id":"c1","function":{"name":"shell","arguments":"{\"command\":[\"ls\"]}"}}] },
                "finish_reason": "tool_calls",
            }]
        });
        let anthropic = chat_response_to_anthropic(&chat).unwrap();
        assert_eq!(anthropic["stop_reason"], "tool_use");
        assert_eq!(anthropic["content"][0]["type"], "tool_use");
        assert_eq!(anthropic["content"][0]["name"], "shell");
        assert_eq!(anthropic["content"][0]["input"]["command"][0], "ls");
    }
}
