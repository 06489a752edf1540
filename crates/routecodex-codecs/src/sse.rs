use serde_json::{json, Value};

use routecodex_core::error::Result;

/// One parsed Server-Sent Event (spec §3 SSEStream, §4.3.4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Line-buffering RFC-compatible SSE parser: `event:`/`data:` lines, events
/// delimited by a blank line. Stateful across chunk boundaries so it can sit
/// in front of a byte stream that arrives in arbitrary-sized pieces.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        SseDecoder::default()
    }

    /// Feeds a chunk of upstream bytes, returning every complete event
    /// found so far. Incomplete trailing lines are retained for the next
    /// call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        loop {
            let Some(newline_pos) = self.buffer.find('\n') else { break };
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_pos);

            if line.is_empty() {
                if !self.pending_data.is_empty() || self.pending_event.is_some() {
                    events.push(SseEvent {
                        event: self.pending_event.take(),
                        data: self.pending_data.join("\n"),
                    });
                    self.pending_data.clear();
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.pending_event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.pending_data.push(rest.trim_start().to_string());
            }
        }

        events
    }
}

/// Terminator check shared by both dialects (spec §4.3.4): `[DONE]`,
/// `response.completed`, or (handled by the caller) upstream EOF.
pub fn is_terminal(event: &SseEvent) -> bool {
    event.data.trim() == "[DONE]" || event.event.as_deref() == Some("response.completed")
}

/// Accumulates OpenAI-Chat SSE deltas into the single JSON object a
/// non-streaming client would have received (spec §4.3.4, §8 scenario 4):
/// concatenates `choices[].delta.content`, merges `tool_calls` deltas by
/// index, and carries through the first `finish_reason` seen.
#[derive(Default)]
pub struct ChatAccumulator {
    content: String,
    tool_calls: Vec<Value>,
    finish_reason: Option<String>,
    model: Option<String>,
    id: Option<String>,
}

impl ChatAccumulator {
    pub fn new() -> Self {
        ChatAccumulator::default()
    }

    /// Feeds one decoded SSE event's `data` payload. Malformed individual
    /// events are skipped, not fatal (spec §4.3.4 "on decode error for an
    /// individual event, skip it and record a parse-error signal").
    pub fn push(&mut self, data: &str) -> Option<&'static str> {
        if data.trim() == "[DONE]" {
            return None;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Some("parse-error");
        };

        if self.id.is_none() {
            self.id = value.get("id").and_then(|v| v.as_str()).map(str::to_string);
        }
        if self.model.is_none() {
            self.model = value.get("model").and_then(|v| v.as_str()).map(str::to_string);
        }

        let Some(choice) = value.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) else {
            return None;
        };
        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                self.content.push_str(text);
            }
            if let Some(deltas) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for tc_delta in deltas {
                    self.merge_tool_call_delta(tc_delta);
                }
            }
        }
        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            self.finish_reason = Some(fr.to_string());
        }
        None
    }

    fn merge_tool_call_delta(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
        while self.tool_calls.len() <= index {
            self.tool_calls.push(json!({
                "id": "",
                "type": "function",
                "function": { "name": "", "arguments": "" },
            }));
        }
        let entry = &mut self.tool_calls[index];
        if let Some(id) = delta.get("id").and_then(|v| v.as_str()) {
            entry["id"] = json!(id);
        }
        if let Some(name) = delta.pointer("/function/name").and_then(|v| v.as_str()) {
            entry["function"]["name"] = json!(name);
        }
        if let Some(args) = delta.pointer("/function/arguments").and_then(|v| v.as_str()) {
            let current = entry["function"]["arguments"].as_str().unwrap_or("").to_string();
            entry["function"]["arguments"] = json!(current + args);
        }
    }

    /// Produces the JSON a non-streaming client would have received.
    pub fn finish(self) -> Value {
        let mut message = json!({ "role": "assistant", "content": self.content });
        if !self.tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(self.tool_calls);
        }
        json!({
            "id": self.id,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
        })
    }
}

/// Accumulates OpenAI Responses SSE deltas via the
/// `response.output_item.added` / `response.output_item.delta` /
/// `response.completed` protocol (spec §4.3.4).
#[derive(Default)]
pub struct ResponsesAccumulator {
    output: Vec<Value>,
    completed: Option<Value>,
}

impl ResponsesAccumulator {
    pub fn new() -> Self {
        ResponsesAccumulator::default()
    }

    pub fn push(&mut self, event_type: Option<&str>, data: &str) -> Option<&'static str> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Some("parse-error");
        };
        match event_type {
            Some("response.output_item.added") => {
                if let Some(item) = value.get("item") {
                    self.output.push(item.clone());
                }
            }
            Some("response.output_item.delta") => {
                let index = value.get("output_index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                if let Some(item) = self.output.get_mut(index) {
                    if let Some(delta_text) = value.pointer("/delta/text").and_then(|t| t.as_str()) {
                        if let Some(content) = item.get_mut("content").and_then(|c| c.as_array_mut()) {
                            if let Some(first) = content.first_mut() {
                                let existing = first.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string();
                                first["text"] = json!(existing + delta_text);
                            }
                        }
                    }
                }
            }
            Some("response.completed") => {
                self.completed = value.get("response").cloned().or(Some(value));
            }
            _ => {}
        }
        None
    }

    pub fn finish(self) -> Value {
        if let Some(completed) = self.completed {
            return completed;
        }
        json!({ "output": self.output })
    }
}

/// Dispatches to whichever accumulator matches the upstream's wire dialect
/// (spec §4.3.4), so callers with a raw SSE byte stream don't need to match
/// on dialect themselves at every `push` call.
pub enum DialectAccumulator {
    Chat(ChatAccumulator),
    Responses(ResponsesAccumulator),
}

impl DialectAccumulator {
    pub fn push(&mut self, event: &SseEvent) -> Option<&'static str> {
        match self {
            DialectAccumulator::Chat(acc) => acc.push(&event.data),
            DialectAccumulator::Responses(acc) => acc.push(event.event.as_deref(), &event.data),
        }
    }

    pub fn finish(self) -> Value {
        match self {
            DialectAccumulator::Chat(acc) => acc.finish(),
            DialectAccumulator::Responses(acc) => acc.finish(),
        }
    }
}

/// Drives an `SseDecoder` + an accumulator to completion over a sequence of
/// already-received byte chunks, producing the equivalent non-streaming
/// JSON (spec §4.3.4). The byte source itself is owned by the caller
/// (Provider module); this function does no I/O.
pub fn accumulate_chat<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> Result<Value> {
    let mut decoder = SseDecoder::new();
    let mut accumulator = ChatAccumulator::new();
    'outer: for chunk in chunks {
        for event in decoder.feed(chunk) {
            if is_terminal(&event) {
                break 'outer;
            }
            accumulator.push(&event.data);
        }
    }
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed(b"data: hel");
        assert!(events.is_empty());
        events = decoder.feed(b"lo\n\n");
        assert_eq!(events, vec![SseEvent { event: None, data: "hello".to_string() }]);
    }

    #[test]
    fn scenario_four_accumulates_deltas_into_single_message() {
        let deltas = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo,\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ];
        let chunks: Vec<&[u8]> = deltas.iter().map(|s| s.as_bytes()).collect();
        let result = accumulate_chat(chunks.into_iter()).unwrap();
        assert_eq!(result["choices"][0]["message"]["content"], "Hello, world");
        assert_eq!(result["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn tool_call_deltas_merge_by_index() {
        let mut accumulator = ChatAccumulator::new();
        accumulator.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"shell","arguments":"{\"a\":"}}]}}]}"#);
        accumulator.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#);
        let result = accumulator.finish();
        assert_eq!(result["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
    }
}
