use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use routecodex_core::dto::{RequestDto, ResponseDto};
use routecodex_core::error::Result;
use routecodex_core::pipeline::{ModuleFactories, ModuleFactory, PipelineModule, Readiness};

use crate::anthropic_chat::{anthropic_request_to_chat, chat_response_to_anthropic};
use crate::responses_chat::{chat_response_to_responses, responses_request_to_chat};
use crate::sse::accumulate_chat;
use crate::tooling::{run_tooling_stage, ToolingPolicy};

/// LLMSwitch: converts between the client-facing protocol and the
/// OpenAI-Chat dialect every Workflow/Compatibility/Provider module speaks
/// internally (spec §4.4 step 1, GLOSSARY).
pub struct AnthropicOpenAiSwitch;
pub struct ResponseChatSwitch { pub tool_schemas: Value }
pub struct OpenAiOpenAiSwitch;

#[async_trait]
impl PipelineModule for AnthropicOpenAiSwitch {
    fn module_type(&self) -> &str {
        "llmswitch-anthropic-openai"
    }

    async fn process_incoming(&self, mut req: RequestDto) -> Result<RequestDto> {
        req.data = anthropic_request_to_chat(&req.data)?;
        Ok(req)
    }

    async fn process_outgoing(&self, mut resp: ResponseDto) -> Result<ResponseDto> {
        resp.data = chat_response_to_anthropic(&resp.data)?;
        Ok(resp)
    }
}

#[async_trait]
impl PipelineModule for OpenAiOpenAiSwitch {
    fn module_type(&self) -> &str {
        "llmswitch-openai-openai"
    }

    async fn process_incoming(&self, req: RequestDto) -> Result<RequestDto> {
        Ok(req)
    }

    async fn process_outgoing(&self, resp: ResponseDto) -> Result<ResponseDto> {
        Ok(resp)
    }
}

#[async_trait]
impl PipelineModule for ResponseChatSwitch {
    fn module_type(&self) -> &str {
        "llmswitch-response-chat"
    }

    async fn process_incoming(&self, mut req: RequestDto) -> Result<RequestDto> {
        let schemas = merge_request_tool_schemas(&self.tool_schemas, &req.data);
        req.data = responses_request_to_chat(&req.data, &schemas)?;
        req.metadata.extra["tool_schemas"] = schemas;
        Ok(req)
    }

    async fn process_outgoing(&self, mut resp: ResponseDto) -> Result<ResponseDto> {
        resp.data = chat_response_to_responses(&resp.data, &self.tool_schemas)?;
        Ok(resp)
    }
}

/// The Responses protocol carries tool declarations alongside the request
/// body (`tools: [{name, parameters|input_schema}, …]`); merge those into
/// the module's config-level schema table so argument normalization (spec
/// §4.3.2) sees client-declared tools too, not just built-in ones.
fn merge_request_tool_schemas(base: &Value, request: &Value) -> Value {
    let mut merged = base.clone();
    if !merged.is_object() {
        merged = json!({});
    }
    if let Some(tools) = request.get("tools").and_then(|t| t.as_array()) {
        let obj = merged.as_object_mut().expect("merged schema table is always an object");
        for tool in tools {
            let Some(name) = tool.get("name").and_then(|n| n.as_str()) else { continue };
            let schema = tool.get("parameters").or_else(|| tool.get("input_schema")).cloned().unwrap_or(json!({}));
            obj.insert(name.to_string(), schema);
        }
    }
    merged
}

/// Workflow: controls streaming vs. non-streaming behavior (spec §4.5,
/// GLOSSARY). `streaming-control` is the only workflow type spec.md names;
/// when `streamingToNonStreaming` is set and the client asked to stream,
/// it downgrades the request so Provider collects a full response, and on
/// the way out the service layer re-synthesizes chunks for the client (the
/// actual SSE synthesis lives in the HTTP handler, which owns the
/// transport; this module only flips the intent flag and records it).
pub struct StreamingControlWorkflow {
    pub streaming_to_non_streaming: bool,
}

#[async_trait]
impl PipelineModule for StreamingControlWorkflow {
    fn module_type(&self) -> &str {
        "streaming-control"
    }

    async fn process_incoming(&self, mut req: RequestDto) -> Result<RequestDto> {
        if req.metadata.stream && self.streaming_to_non_streaming {
            req.metadata.stream = false;
            if let Some(obj) = req.data.as_object_mut() {
                obj.insert("stream".to_string(), Value::Bool(false));
            }
        }
        Ok(req)
    }

    async fn process_outgoing(&self, resp: ResponseDto) -> Result<ResponseDto> {
        Ok(resp)
    }
}

/// Vendor-specific rewrite of the client's `thinking.enabled` flag (spec
/// §4.3.3). Qwen wants a top-level boolean; GLM wants the `thinking` object
/// kept but its `enabled` key renamed to a `type` string (spec.md:200) —
/// distinct enough shapes that one generic rename tuple can't cover both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkingQuirk {
    /// `thinking.enabled: bool` → top-level `enable_thinking: bool`.
    QwenTopLevelFlag,
    /// `thinking.enabled: bool` → `thinking.type: "enabled"|"disabled"`,
    /// dropping `enabled` so the object doesn't carry both keys.
    GlmTypeRename,
}

/// Compatibility: vendor-specific quirks plus the shared OpenAI tooling
/// stage (spec §4.3.3, GLOSSARY). One instance per canonical compatibility
/// type.
pub struct CompatibilityModule {
    type_: String,
    policy: ToolingPolicy,
    thinking_quirk: Option<ThinkingQuirk>,
}

impl CompatibilityModule {
    pub fn new(type_: impl Into<String>, policy: ToolingPolicy) -> Self {
        let type_ = type_.into();
        let thinking_quirk = match type_.as_str() {
            "qwen-compatibility" => Some(ThinkingQuirk::QwenTopLevelFlag),
            "glm-compatibility" => Some(ThinkingQuirk::GlmTypeRename),
            _ => None,
        };
        CompatibilityModule { type_, policy, thinking_quirk }
    }
}

#[async_trait]
impl PipelineModule for CompatibilityModule {
    fn module_type(&self) -> &str {
        &self.type_
    }

    async fn process_incoming(&self, mut req: RequestDto) -> Result<RequestDto> {
        req.data = run_tooling_stage(req.data, &self.policy);

        if let Some(quirk) = self.thinking_quirk {
            let enabled = req.data.get("thinking").and_then(|t| t.get("enabled")).and_then(|v| v.as_bool());
            if let Some(enabled) = enabled {
                match quirk {
                    ThinkingQuirk::QwenTopLevelFlag => {
                        if let Some(obj) = req.data.as_object_mut() {
                            obj.insert("enable_thinking".to_string(), json!(enabled));
                        }
                    }
                    ThinkingQuirk::GlmTypeRename => {
                        if let Some(thinking) = req.data.get_mut("thinking").and_then(|t| t.as_object_mut()) {
                            thinking.remove("enabled");
                            thinking
                                .insert("type".to_string(), json!(if enabled { "enabled" } else { "disabled" }));
                        }
                    }
                }
            }
        }

        Ok(req)
    }

    async fn process_outgoing(&self, resp: ResponseDto) -> Result<ResponseDto> {
        Ok(resp)
    }

    fn readiness(&self) -> Readiness {
        Readiness::Ready
    }
}

/// Builds the default `ModuleFactories` table the assembler uses to
/// instantiate LLMSwitch/Workflow/Compatibility modules by their canonical
/// type string (spec §9 "module registration happens through a
/// name-to-factory table").
pub fn default_factories(tool_schemas: Value) -> ModuleFactories {
    let mut factories = ModuleFactories::default();

    factories.register_llm_switch(
        "llmswitch-anthropic-openai",
        Arc::new(|_| Ok(Arc::new(AnthropicOpenAiSwitch) as Arc<dyn PipelineModule>)),
    );
    factories.register_llm_switch(
        "llmswitch-openai-openai",
        Arc::new(|_| Ok(Arc::new(OpenAiOpenAiSwitch) as Arc<dyn PipelineModule>)),
    );
    {
        let schemas = tool_schemas.clone();
        let factory: ModuleFactory = Arc::new(move |_| {
            Ok(Arc::new(ResponseChatSwitch { tool_schemas: schemas.clone() }) as Arc<dyn PipelineModule>)
        });
        factories.register_llm_switch("llmswitch-response-chat", factory);
    }

    factories.register_workflow(
        "streaming-control",
        Arc::new(|decl| {
            let streaming_to_non_streaming =
                decl.config.get("streamingToNonStreaming").and_then(|v| v.as_bool()).unwrap_or(true);
            Ok(Arc::new(StreamingControlWorkflow { streaming_to_non_streaming }) as Arc<dyn PipelineModule>)
        }),
    );

    for compat_type in [
        "qwen-compatibility",
        "glm-compatibility",
        "iflow-compatibility",
        "lmstudio-compatibility",
        "anthropic-compatibility",
        "openai-compatibility",
    ] {
        let policy = tooling_policy_from_env();
        let type_owned = compat_type.to_string();
        factories.register_compatibility(
            compat_type,
            Arc::new(move |_| Ok(Arc::new(CompatibilityModule::new(type_owned.clone(), policy.clone())) as Arc<dyn PipelineModule>)),
        );
    }

    factories
}

/// Reads `RCC_ALLOWED_TOOLS` / `RCC_TOOL_LIMIT` / `RCC_SYSTEM_TOOL_GUIDANCE`
/// (spec §6, §9 open question: allow-list is additive over no built-in set
/// here — an implementer decision recorded in DESIGN.md).
fn tooling_policy_from_env() -> ToolingPolicy {
    let allow_list = std::env::var("RCC_ALLOWED_TOOLS")
        .ok()
        .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect());
    let tool_limit = std::env::var("RCC_TOOL_LIMIT").ok().and_then(|s| s.parse().ok());
    let guidance_enabled = std::env::var("RCC_SYSTEM_TOOL_GUIDANCE").map(|v| v != "0").unwrap_or(true);
    ToolingPolicy { allow_list, tool_limit, guidance_enabled }
}

/// Re-exposed for the Workflow/SSE bridging described in spec §4.5: given a
/// sequence of raw upstream SSE chunks, produce the JSON a non-streaming
/// client would have received. Used by `routecodex-service` when a pipeline
/// downgraded a streaming request.
pub fn sse_to_json<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> Result<Value> {
    accumulate_chat(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routecodex_core::dto::{RequestMetadata, RouteInfo};

    fn test_request(data: Value) -> RequestDto {
        RequestDto {
            data,
            route: RouteInfo {
                provider_id: "test".to_string(),
                model_id: "test-model".to_string(),
                request_id: "req-1".to_string(),
                timestamp: 0,
            },
            metadata: RequestMetadata::default(),
            debug: Default::default(),
        }
    }

    #[tokio::test]
    async fn qwen_thinking_enabled_hoists_to_top_level_flag() {
        let module = CompatibilityModule::new("qwen-compatibility", ToolingPolicy::default());
        let req = test_request(json!({"messages": [], "thinking": {"enabled": true}}));
        let req = module.process_incoming(req).await.unwrap();
        assert_eq!(req.data["enable_thinking"], true);
        assert_eq!(req.data["thinking"], json!({"enabled": true}));
    }

    #[tokio::test]
    async fn glm_thinking_enabled_renames_to_type_in_place() {
        let module = CompatibilityModule::new("glm-compatibility", ToolingPolicy::default());
        let req = test_request(json!({"messages": [], "thinking": {"enabled": true}}));
        let req = module.process_incoming(req).await.unwrap();
        assert_eq!(req.data["thinking"], json!({"type": "enabled"}));
    }

    #[tokio::test]
    async fn glm_thinking_disabled_renames_to_type_disabled() {
        let module = CompatibilityModule::new("glm-compatibility", ToolingPolicy::default());
        let req = test_request(json!({"messages": [], "thinking": {"enabled": false}}));
        let req = module.process_incoming(req).await.unwrap();
        assert_eq!(req.data["thinking"], json!({"type": "disabled"}));
    }
}
