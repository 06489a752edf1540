use std::collections::HashSet;

use regex::Regex;
use serde_json::{json, Value};

use routecodex_core::dto::{ExecutedCommand, ToolEnvelope, ToolMeta, ToolRef, ToolResult};
use routecodex_core::error::{ConversionFailureKind, Result, RouteCodexError};

const DEFAULT_TOOL_CEILING: usize = 32;
const DEFAULT_TOOL_OUTPUT_LIMIT: usize = 16 * 1024;
const GUIDANCE_MESSAGE: &str = "You have access to a set of tools. Call at most one tool per turn \
and wait for its result before continuing.";

fn sanitize_regex() -> Regex {
    Regex::new(r"[^A-Za-z0-9_-]").expect("static tool-name sanitizer regex")
}

/// Sanitizes a tool name to `[A-Za-z0-9_-]{1,64}` (spec §4.3.1).
pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned = sanitize_regex().replace_all(name, "_").into_owned();
    let truncated: String = cleaned.chars().take(64).collect();
    if truncated.is_empty() { "tool".to_string() } else { truncated }
}

/// Configuration for the shared OpenAI tooling stage (spec §4.3.3), sourced
/// from `RCC_ALLOWED_TOOLS` / `RCC_TOOL_LIMIT` / `RCC_SYSTEM_TOOL_GUIDANCE`.
#[derive(Debug, Clone, Default)]
pub struct ToolingPolicy {
    pub allow_list: Option<Vec<String>>,
    pub tool_limit: Option<usize>,
    pub guidance_enabled: bool,
}

/// Runs the shared normalization pass of spec §4.3.3 on an OpenAI-Chat
/// request body, in place semantics but functional style (returns a new
/// value): dedup tool defs by name, enforce the count ceiling, apply an
/// allow-list if configured, stringify tool-call arguments, and inject the
/// tool-usage guidance message at most once.
pub fn run_tooling_stage(mut chat_request: Value, policy: &ToolingPolicy) -> Value {
    if let Some(tools) = chat_request.get("tools").and_then(|t| t.as_array()).cloned() {
        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for tool in tools {
            let name = tool
                .pointer("/function/name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(allow_list) = &policy.allow_list {
                if !allow_list.iter().any(|a| a == &name) {
                    continue;
                }
            }
            deduped.push(tool);
        }
        let ceiling = policy.tool_limit.unwrap_or(DEFAULT_TOOL_CEILING);
        deduped.truncate(ceiling);

        let has_tools = !deduped.is_empty();
        if let Some(obj) = chat_request.as_object_mut() {
            obj.insert("tools".to_string(), Value::Array(deduped));
            if has_tools && policy.guidance_enabled {
                inject_guidance_once(obj);
            }
        }
    }

    if let Some(messages) = chat_request.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for message in messages.iter_mut() {
            if let Some(tool_calls) = message.get_mut("tool_calls").and_then(|t| t.as_array_mut()) {
                for call in tool_calls.iter_mut() {
                    stringify_arguments(call);
                }
            }
        }
    }

    chat_request
}

fn stringify_arguments(call: &mut Value) {
    let Some(function) = call.get_mut("function").and_then(|f| f.as_object_mut()) else { return };
    let current = function.get("arguments").cloned().unwrap_or(Value::Null);
    let stringified = match current {
        Value::String(s) => s,
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    };
    function.insert("arguments".to_string(), Value::String(stringified));
}

fn inject_guidance_once(obj: &mut serde_json::Map<String, Value>) {
    let messages = obj.entry("messages").or_insert_with(|| Value::Array(Vec::new()));
    let Some(messages) = messages.as_array_mut() else { return };
    let already_present = messages.iter().any(|m| {
        m.get("role").and_then(|r| r.as_str()) == Some("system")
            && m.get("content").and_then(|c| c.as_str()) == Some(GUIDANCE_MESSAGE)
    });
    if !already_present {
        messages.insert(0, json!({ "role": "system", "content": GUIDANCE_MESSAGE }));
    }
}

/// Classes of tool-output failure the self-repair mechanism of spec §4.3.2
/// recognizes, extracted to a table per spec §9's redesign note so the
/// exact hint text never has to be reproduced inline at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    UnknownTool,
    MalformedArguments,
    ViewImageOnNonImage,
    ApplyPatchVerificationFailed,
}

/// `{failureClass → template}`. `{allowed_tools}` and `{example}` are
/// substituted by `render_self_repair_hint`.
fn template_for(class: FailureClass) -> &'static str {
    match class {
        FailureClass::UnknownTool => {
            "The tool you called is not available. Allowed tools: {allowed_tools}. \
             Example of a valid call: {example}"
        }
        FailureClass::MalformedArguments => {
            "Your tool call's arguments could not be parsed. Allowed tools: {allowed_tools}. \
             Example of a valid call: {example}"
        }
        FailureClass::ViewImageOnNonImage => {
            "view_image only accepts paths to image files. Allowed tools: {allowed_tools}. \
             Example of a valid call: {example}"
        }
        FailureClass::ApplyPatchVerificationFailed => {
            "The patch could not be verified against the current file contents. \
             Allowed tools: {allowed_tools}. Example of a valid call: {example}"
        }
    }
}

/// Renders the structured hint text for a self-repair rewrite (spec §4.3.2,
/// §9). Must match bit-exactly across implementations, which is why the
/// template lives in one place instead of being composed ad hoc.
pub fn render_self_repair_hint(class: FailureClass, allowed_tools: &[String], example: &str) -> String {
    template_for(class)
        .replace("{allowed_tools}", &allowed_tools.join(", "))
        .replace("{example}", example)
}

/// Truncation ceiling for tool stdout/stderr, from `RCC_TOOL_OUTPUT_LIMIT`
/// (spec §9 open question), falling back to 16 KiB.
pub fn tool_output_limit() -> usize {
    std::env::var("RCC_TOOL_OUTPUT_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_TOOL_OUTPUT_LIMIT)
}

/// Builds a canonical `rcc.tool.v1` envelope from a tool call and its
/// string-encoded result payload (spec §3, §8 scenario 2), then applies the
/// truncation/sanitization invariants.
pub fn build_tool_envelope(
    call_id: &str,
    tool_name: &str,
    arguments: Value,
    command: Vec<String>,
    workdir: Option<String>,
    success: bool,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    output: String,
    truncate_limit: usize,
    ts: i64,
) -> ToolEnvelope {
    let mut envelope = ToolEnvelope {
        version: ToolEnvelope::VERSION.to_string(),
        tool: ToolRef { name: tool_name.to_string(), call_id: call_id.to_string() },
        arguments,
        executed: ExecutedCommand { command, workdir },
        result: ToolResult { success, exit_code, duration_seconds: None, stdout, stderr, output },
        meta: ToolMeta { call_id: call_id.to_string(), ts },
    };
    envelope.sanitize(truncate_limit);
    envelope
}

/// Parses a tool-result JSON string into `{success, exit_code, stdout}`
/// fields for `build_tool_envelope`, tolerating the loose shapes upstream
/// function-call outputs arrive in (spec §8 scenario 2).
pub fn parse_tool_output(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|_| RouteCodexError::ConversionFailed {
        kind: ConversionFailureKind::ParseError,
        detail: format!("tool output is not valid JSON: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_tool_names_to_allowed_alphabet() {
        assert_eq!(sanitize_tool_name("my tool!"), "my_tool_");
        assert_eq!(sanitize_tool_name(""), "tool");
    }

    #[test]
    fn tooling_stage_is_idempotent() {
        let request = json!({
            "messages": [],
            "tools": [
                {"type":"function","function":{"name":"shell","parameters":{}}},
                {"type":"function","function":{"name":"shell","parameters":{}}},
            ]
        });
        let policy = ToolingPolicy { allow_list: None, tool_limit: None, guidance_enabled: true };
        let once = run_tooling_stage(request, &policy);
        let twice = run_tooling_stage(once.clone(), &policy);
        assert_eq!(once, twice);
        assert_eq!(once["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn stringifies_null_arguments_to_empty_object() {
        let mut call = json!({"function": {"name": "shell", "arguments": Value::Null}});
        stringify_arguments(&mut call);
        assert_eq!(call["function"]["arguments"], "{}");
    }

    #[test]
    fn self_repair_hint_matches_template_exactly() {
        let hint = render_self_repair_hint(
            FailureClass::UnknownTool,
            &["shell".to_string(), "view_image".to_string()],
            "shell({\"command\":[\"ls\"]})",
        );
        assert!(hint.starts_with("The tool you called is not available."));
        assert!(hint.contains("shell, view_image"));
    }
}
