use std::collections::HashMap;

use serde_json::{json, Value};

use routecodex_core::error::{ConversionFailureKind, Result, RouteCodexError};

use crate::tooling::{build_tool_envelope, parse_tool_output, render_self_repair_hint, tool_output_limit, FailureClass};

fn schema_violation(detail: impl Into<String>) -> RouteCodexError {
    RouteCodexError::ConversionFailed { kind: ConversionFailureKind::SchemaViolation, detail: detail.into() }
}

const SHELL_METACHARACTERS: &[&str] = &["|", ">", "<", ";", "&&", "||", "<<"];

fn contains_shell_metacharacter(s: &str) -> bool {
    SHELL_METACHARACTERS.iter().any(|m| s.contains(m))
}

/// Tokenizes a shell command string on whitespace, respecting single and
/// double quotes, for the array-of-string argument coercion of spec §4.3.2.
fn shell_split(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Coerces a single argument value to the type its JSON Schema declares
/// (spec §4.3.2). `shell.command` gets special handling: a bare string is
/// tokenized, and if the result still contains shell metacharacters it's
/// wrapped as `["bash", "-lc", original]` instead of split naively.
pub fn coerce_argument(name: &str, value: Value, expected_type: &str) -> Value {
    match expected_type {
        "string" => value,
        "array" if name == "command" => match value {
            Value::String(s) => {
                if contains_shell_metacharacter(&s) {
                    json!(["bash", "-lc", s])
                } else {
                    Value::Array(shell_split(&s).into_iter().map(Value::String).collect())
                }
            }
            already_array @ Value::Array(_) => already_array,
            other => other,
        },
        "array" => match value {
            Value::String(s) => Value::Array(shell_split(&s).into_iter().map(Value::String).collect()),
            other => other,
        },
        "object" => match value {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        },
        _ => value,
    }
}

/// Normalizes every argument of a tool call's JSON-encoded `arguments`
/// object against a JSON Schema's declared property types (spec §4.3.2,
/// §8 scenario 3).
pub fn normalize_arguments(arguments_json: &str, schema: &Value) -> Result<String> {
    let mut parsed: Value = serde_json::from_str(arguments_json).map_err(|e| RouteCodexError::ConversionFailed {
        kind: ConversionFailureKind::ParseError,
        detail: format!("tool call arguments not valid JSON: {e}"),
    })?;

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        if let Some(obj) = parsed.as_object_mut() {
            for (name, prop_schema) in properties {
                if let Some(value) = obj.remove(name) {
                    let expected_type = prop_schema.get("type").and_then(|t| t.as_str()).unwrap_or("string");
                    obj.insert(name.clone(), coerce_argument(name, value, expected_type));
                }
            }
        }
    }

    Ok(parsed.to_string())
}

/// Recognizes which of spec §4.3.2's known failure classes a tool's own
/// result text reports, from the substrings a tool runner actually emits
/// for these cases. `None` means the output is a normal result, not one of
/// the cases self-repair handles.
fn classify_tool_failure(tool_name: &str, success: bool, output: &str, stderr: Option<&str>) -> Option<FailureClass> {
    if success {
        return None;
    }
    let haystack = format!("{output} {}", stderr.unwrap_or_default()).to_lowercase();
    if haystack.contains("unknown tool") || haystack.contains("no such tool") {
        Some(FailureClass::UnknownTool)
    } else if haystack.contains("could not parse") || haystack.contains("invalid json") || haystack.contains("malformed") {
        Some(FailureClass::MalformedArguments)
    } else if tool_name == "view_image" && (haystack.contains("not an image") || haystack.contains("unsupported image")) {
        Some(FailureClass::ViewImageOnNonImage)
    } else if tool_name.contains("apply_patch") && haystack.contains("verif") {
        Some(FailureClass::ApplyPatchVerificationFailed)
    } else {
        None
    }
}

/// Builds one illustrative valid call for the self-repair hint's
/// `{example}` slot: `name({...})` with one placeholder value per required
/// property in the tool's JSON Schema.
fn example_call(name: &str, schema: &Value) -> String {
    let mut args = serde_json::Map::new();
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (prop_name, prop_schema) in properties {
            let placeholder = match prop_schema.get("type").and_then(|t| t.as_str()) {
                Some("array") => json!([]),
                Some("object") => json!({}),
                Some("integer") | Some("number") => json!(0),
                Some("boolean") => json!(false),
                _ => json!("value"),
            };
            args.insert(prop_name.clone(), placeholder);
        }
    }
    format!("{name}({})", Value::Object(args))
}

/// Converts an OpenAI Responses request body into an OpenAI-Chat request
/// body (spec §4.3.2). `instructions` becomes a system message;
/// `function_call_output` items are wrapped in the `rcc.tool.v1` envelope
/// before becoming `{role:"tool"}` messages; a result reporting a known
/// self-repair failure class (spec §9) is rewritten into a structured hint
/// instead of the envelope.
pub fn responses_request_to_chat(responses: &Value, tool_schemas: &Value) -> Result<Value> {
    let mut messages = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    if let Some(instructions) = responses.get("instructions").and_then(|v| v.as_str()) {
        messages.push(json!({ "role": "system", "content": instructions }));
    }

    let input = responses
        .get("input")
        .and_then(|v| v.as_array())
        .ok_or_else(|| schema_violation("responses request missing 'input' array"))?;

    for item in input {
        let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("message");
        match item_type {
            "message" => {
                let role = item.get("role").and_then(|r| r.as_str()).unwrap_or("user");
                let text = item
                    .get("content")
                    .and_then(|c| c.as_array())
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| {
                                matches!(
                                    b.get("type").and_then(|t| t.as_str()),
                                    Some("input_text") | Some("output_text") | Some("text")
                                )
                                .then(|| b.get("text").and_then(|t| t.as_str()).unwrap_or_default())
                            })
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                messages.push(json!({ "role": role, "content": text }));
            }
            "function_call" | "tool_call" => {
                let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                let call_id =
                    item.get("call_id").or_else(|| item.get("id")).and_then(|v| v.as_str()).unwrap_or_default();
                let raw_arguments = item.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
                let schema = tool_schemas.get(name).cloned().unwrap_or(json!({}));
                let arguments = normalize_arguments(raw_arguments, &schema)?;
                call_names.insert(call_id.to_string(), name.to_string());
                messages.push(json!({
                    "role": "assistant",
                    "tool_calls": [{
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments },
                    }],
                }));
            }
            "function_call_output" | "tool_result" | "tool_message" => {
                let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or_default();
                let raw_output = item.get("output").and_then(|v| v.as_str()).unwrap_or("{}");
                let parsed = parse_tool_output(raw_output).unwrap_or(json!({ "output": raw_output }));
                let success = parsed.get("success").and_then(|v| v.as_bool())
                    .or_else(|| parsed.get("exit_code").and_then(|v| v.as_i64()).map(|c| c == 0))
                    .unwrap_or(true);
                let exit_code = parsed.get("exit_code").and_then(|v| v.as_i64()).map(|v| v as i32);
                let stdout = parsed.get("stdout").and_then(|v| v.as_str()).map(str::to_string);
                let stderr = parsed.get("stderr").and_then(|v| v.as_str()).map(str::to_string);
                let output = stdout.clone().unwrap_or_else(|| raw_output.to_string());

                let tool_name = call_names.get(call_id).cloned().unwrap_or_default();
                let content = match classify_tool_failure(&tool_name, success, &output, stderr.as_deref()) {
                    Some(class) => {
                        let allowed_tools: Vec<String> = tool_schemas
                            .as_object()
                            .map(|m| m.keys().cloned().collect())
                            .unwrap_or_default();
                        let schema = tool_schemas.get(&tool_name).cloned().unwrap_or(json!({}));
                        let example = example_call(&tool_name, &schema);
                        json!(render_self_repair_hint(class, &allowed_tools, &example))
                    }
                    None => {
                        let envelope = build_tool_envelope(
                            call_id,
                            &tool_name,
                            Value::Null,
                            Vec::new(),
                            None,
                            success,
                            exit_code,
                            stdout,
                            stderr,
                            output,
                            tool_output_limit(),
                            0,
                        );
                        serde_json::to_value(envelope)?
                    }
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": content,
                }));
            }
            _ => {}
        }
    }

    let mut chat = json!({ "model": responses.get("model").cloned().unwrap_or(Value::Null), "messages": messages });
    if let Some(stream) = responses.get("stream") {
        chat["stream"] = stream.clone();
    }
    Ok(chat)
}

/// Converts an OpenAI-Chat response into an OpenAI Responses `output[]`
/// array (spec §4.3.2): an optional `reasoning` item, a `message` item, then
/// one `function_call` item per tool call.
pub fn chat_response_to_responses(chat: &Value, tool_schemas: &Value) -> Result<Value> {
    let choice = chat
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| schema_violation("chat response missing 'choices[0]'"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| schema_violation("chat response missing 'choices[0].message'"))?;

    let mut output = Vec::new();

    if let Some(reasoning) = message.get("reasoning_content").and_then(|v| v.as_str()) {
        if !reasoning.is_empty() {
            output.push(json!({ "type": "reasoning", "content": [{"type":"text","text": reasoning}] }));
        }
    }

    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            output.push(json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}],
            }));
        }
    }

    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for call in tool_calls {
            let name = call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or_default();
            let raw_arguments = call.pointer("/function/arguments").and_then(|v| v.as_str()).unwrap_or("{}");
            let schema = tool_schemas.get(name).cloned().unwrap_or(json!({}));
            let arguments = normalize_arguments(raw_arguments, &schema)?;
            output.push(json!({
                "type": "function_call",
                "call_id": call.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
                "name": name,
                "arguments": arguments,
            }));
        }
    }

    Ok(json!({ "output": output, "usage": chat.get("usage").cloned().unwrap_or(Value::Null) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_two_function_call_output_wraps_in_tool_envelope() {
        let responses = json!({
            "instructions": "be terse",
            "input": [{"type":"function_call_output","call_id":"c1","output":"{\"exit_code\":0,\"stdout\":\"ok\"}"}],
        });
        let chat = responses_request_to_chat(&responses, &json!({})).unwrap();
        assert_eq!(chat["messages"][0]["role"], "system");
        assert_eq!(chat["messages"][0]["content"], "be terse");
        let envelope = &chat["messages"][1]["content"];
        assert_eq!(envelope["version"], "rcc.tool.v1");
        assert_eq!(envelope["result"]["success"], true);
        assert_eq!(envelope["result"]["exit_code"], 0);
        assert_eq!(envelope["result"]["stdout"], "ok");
    }

    #[test]
    fn scenario_three_pipe_triggers_bash_lc_wrap() {
        let schema = json!({"properties": {"command": {"type": "array"}}});
        let normalized = normalize_arguments(r#"{"command":"find . | head -3"}"#, &schema).unwrap();
        let value: Value = serde_json::from_str(&normalized).unwrap();
        assert_eq!(value["command"], json!(["bash", "-lc", "find . | head -3"]));
    }

    #[test]
    fn plain_command_string_is_tokenized_not_wrapped() {
        let schema = json!({"properties": {"command": {"type": "array"}}});
        let normalized = normalize_arguments(r#"{"command":"ls -la /tmp"}"#, &schema).unwrap();
        let value: Value = serde_json::from_str(&normalized).unwrap();
        assert_eq!(value["command"], json!(["ls", "-la", "/tmp"]));
    }

    #[test]
    fn unknown_tool_output_is_rewritten_into_self_repair_hint() {
        let schemas = json!({"shell": {"properties": {"command": {"type": "array"}}}});
        let responses = json!({
            "input": [
                {"type":"function_call","call_id":"c1","name":"frobnicate","arguments":"{}"},
                {"type":"function_call_output","call_id":"c1","output":"{\"success\":false,\"stderr\":\"unknown tool: frobnicate\"}"},
            ],
        });
        let chat = responses_request_to_chat(&responses, &schemas).unwrap();
        let content = chat["messages"][1]["content"].as_str().unwrap();
        assert!(content.starts_with("The tool you called is not available."));
        assert!(content.contains("shell"));
    }

    #[test]
    fn successful_tool_output_still_wraps_in_envelope() {
        let responses = json!({
            "input": [
                {"type":"function_call","call_id":"c1","name":"shell","arguments":"{}"},
                {"type":"function_call_output","call_id":"c1","output":"{\"exit_code\":0,\"stdout\":\"ok\"}"},
            ],
        });
        let chat = responses_request_to_chat(&responses, &json!({})).unwrap();
        let envelope = &chat["messages"][1]["content"];
        assert_eq!(envelope["version"], "rcc.tool.v1");
        assert_eq!(envelope["tool"]["name"], "shell");
    }
}
