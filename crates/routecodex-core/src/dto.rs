use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

/// Routing info attached to every request DTO (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    pub provider_id: String,
    pub model_id: String,
    pub request_id: String,
    pub timestamp: i64,
}

/// Free-form request metadata: entry endpoint, streaming intent, and any
/// client-supplied routing hints (`previous_response_id`, `thinking`, tool
/// allow-lists, …). Unmodeled fields stay in `extra` so round-tripping through
/// the pipeline never silently drops client input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub entry_endpoint: String,
    pub stream: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

/// One entry in `debug.stages[]`: the module name and a snapshot of the DTO
/// after that module ran, recorded only when stage snapshots are enabled
/// (`ROUTECODEX_HUB_SNAPSHOTS`, SPEC_FULL.md §G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub module: String,
    pub direction: StageDirection,
    pub snapshot: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    pub enabled: bool,
    #[serde(default)]
    pub stages: Vec<StageSnapshot>,
}

/// Request DTO threaded through the four pipeline modules (spec §3). `data`
/// carries the protocol-native payload; each module replaces it with a new
/// value rather than mutating it in place, so the traversal reads as a chain
/// of pure transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDto {
    pub data: Value,
    pub route: RouteInfo,
    pub metadata: RequestMetadata,
    #[serde(default)]
    pub debug: DebugInfo,
}

impl RequestDto {
    pub fn record_stage(&mut self, module: &str, direction: StageDirection) {
        if self.debug.enabled {
            self.debug.stages.push(StageSnapshot {
                module: module.to_string(),
                direction,
                snapshot: self.data.clone(),
            });
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub pipeline_id: String,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub stages: Vec<StageSnapshot>,
}

/// Response DTO returned from a pipeline traversal (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseDto {
    pub data: Value,
    pub metadata: ResponseMetadata,
}

/// Tracks wall-clock elapsed time for `ResponseMetadata::processing_time_ms`
/// without depending on `Instant::now()` being callable at arbitrary points
/// (the pipeline runtime owns one clock per request).
pub struct RequestClock {
    start: Instant,
}

impl RequestClock {
    pub fn start() -> Self {
        RequestClock { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// The canonical tool-result envelope `rcc.tool.v1` (spec §3, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub version: String,
    pub tool: ToolRef,
    pub arguments: Value,
    pub executed: ExecutedCommand,
    pub result: ToolResult,
    pub meta: ToolMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRef {
    pub name: String,
    pub call_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutedCommand {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub call_id: String,
    pub ts: i64,
}

impl ToolEnvelope {
    pub const VERSION: &'static str = "rcc.tool.v1";

    /// Patterns that mark a tool invocation as write-type (spec §8): its
    /// script body must never be echoed back to the model.
    fn is_write_script(command: &[String]) -> bool {
        let joined = command.join(" ");
        joined.contains("<<")
            || joined.contains("apply_patch")
            || joined.contains("*** Begin Patch")
    }

    /// Applies the truncation/sanitization invariants of spec §8: write-type
    /// commands drop their script body entirely, and every string field in
    /// `result` is capped at `limit` bytes with a `...(truncated)` suffix.
    pub fn sanitize(&mut self, limit: usize) {
        if Self::is_write_script(&self.executed.command) {
            self.executed.command.clear();
        }
        self.result.output = truncate_with_suffix(&self.result.output, limit);
        if let Some(stdout) = self.result.stdout.take() {
            self.result.stdout = Some(truncate_with_suffix(&stdout, limit));
        }
        if let Some(stderr) = self.result.stderr.take() {
            self.result.stderr = Some(truncate_with_suffix(&stderr, limit));
        }
    }
}

fn truncate_with_suffix(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut truncated = s.chars().take(limit).collect::<String>();
    truncated.push_str("...(truncated)");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_appends_suffix_only_when_over_limit() {
        assert_eq!(truncate_with_suffix("short", 10), "short");
        let long = "x".repeat(20);
        let truncated = truncate_with_suffix(&long, 10);
        assert!(truncated.ends_with("...(truncated)"));
        assert_eq!(&truncated[..10], &"x".repeat(10));
    }

    #[test]
    fn write_script_command_is_cleared_on_sanitize() {
        let mut envelope = ToolEnvelope {
            version: ToolEnvelope::VERSION.to_string(),
            tool: ToolRef { name: "apply_patch".into(), call_id: "c1".into() },
            arguments: Value::Null,
            executed: ExecutedCommand {
                command: vec!["apply_patch".into(), "*** Begin Patch".into()],
                workdir: None,
            },
            result: ToolResult { success: true, output: "ok".into(), ..Default::default() },
            meta: ToolMeta { call_id: "c1".into(), ts: 0 },
        };
        envelope.sanitize(1000);
        assert!(envelope.executed.command.is_empty());
    }
}
