mod normalize;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use normalize::process;

/// The three client-facing protocols RouteCodex can be configured to speak
/// (spec §1, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    OpenaiChat,
    OpenaiResponses,
    AnthropicMessages,
}

impl Protocol {
    /// The LLMSwitch module type this protocol resolves to by default
    /// (spec §4.4 step 1).
    pub fn default_llm_switch(self) -> &'static str {
        match self {
            Protocol::AnthropicMessages => "llmswitch-anthropic-openai",
            Protocol::OpenaiChat => "llmswitch-openai-openai",
            Protocol::OpenaiResponses => "llmswitch-response-chat",
        }
    }
}

/// Compatibility declarations can arrive as a shorthand string
/// (`"iflow/thinking:enabled"`) or as an explicit `{type, config}` struct;
/// normalization (§4.1 step 4) always produces the struct form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompatibilityDecl {
    Shorthand(String),
    Explicit { #[serde(rename = "type")] type_: String, #[serde(default)] config: Value },
}

/// A `{maxTokens, maxContext, compatibility?}` entry under a provider's
/// `models` map (spec §3 ConfigDocument).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDecl {
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_context: Option<u64>,
    #[serde(default)]
    pub compatibility: Option<CompatibilityDecl>,
}

/// An OAuth descriptor as it appears in the user-facing `ConfigDocument`,
/// before `tokenFile` gets its family default / `~` expansion applied
/// (spec §4.1 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthDecl {
    #[serde(default)]
    pub token_file: Option<String>,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// The provider family this OAuth flow belongs to (`qwen`, `iflow`, …),
    /// used to pick the device-code/refresh-token flow and the token-file
    /// default path.
    pub family: String,
}

/// A provider entry in the user-facing `ConfigDocument` (spec §3). `apiKey`
/// accepts either a bare string or an array; normalization always explodes
/// it into `key1..keyN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDecl {
    #[serde(rename = "type")]
    pub type_: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<ApiKeyDecl>,
    #[serde(default)]
    pub oauth: BTreeMap<String, OAuthDecl>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelDecl>,
    #[serde(default)]
    pub compatibility: Option<CompatibilityDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiKeyDecl {
    Single(String),
    Many(Vec<String>),
}

impl ApiKeyDecl {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ApiKeyDecl::Single(s) => vec![s],
            ApiKeyDecl::Many(v) => v,
        }
    }
}

/// The user-facing configuration document, loaded verbatim from the JSON
/// file named by `ROUTECODEX_CONFIG` (spec §3, §6). Immutable for the
/// lifetime of the process once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub input_protocol: Protocol,
    #[serde(default = "default_output_protocol")]
    pub output_protocol: Protocol,
    pub providers: BTreeMap<String, ProviderDecl>,
    pub routing: BTreeMap<String, Vec<String>>,
    /// Legacy top-level `providers` some configs still carry instead of
    /// nesting under `virtualrouter`; normalization step 1 folds this in.
    #[serde(default)]
    pub virtualrouter: Option<VirtualRouterDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRouterDecl {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderDecl>,
}

fn default_output_protocol() -> Protocol {
    Protocol::OpenaiChat
}

/// A fully resolved OAuth descriptor: `tokenFile` has had `~` expanded and
/// the family default applied (spec §4.1 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub token_file: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub family: String,
}

/// A provider entry after canonicalization: explicit key map instead of a
/// bare `apiKey[]`, canonical `type`, struct-form compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedProvider {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub base_url: String,
    pub keys: BTreeMap<String, String>,
    pub oauth: BTreeMap<String, OAuthConfig>,
    pub models: BTreeMap<String, ModelDecl>,
    pub compatibility: Option<CompatibilityDecl>,
}

/// `ConfigDocument` after the normalization pipeline of spec §4.1: canonical
/// provider types, exploded keys, resolved OAuth paths, lexically sorted
/// collections for deterministic assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedConfig {
    pub input_protocol: Protocol,
    pub output_protocol: Protocol,
    pub providers: BTreeMap<String, NormalizedProvider>,
    pub routing: BTreeMap<String, Vec<String>>,
}

/// Two-level key index: per-provider `{alias → realKey}` plus a global
/// fallback (spec §3 KeyMappings). OAuth aliases resolve through
/// `oauth_aliases` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMappings {
    pub per_provider: BTreeMap<String, BTreeMap<String, String>>,
    pub global: BTreeMap<String, String>,
    pub oauth_aliases: BTreeMap<String, BTreeMap<String, OAuthConfig>>,
}

impl KeyMappings {
    /// Resolves `(providerId, keyId)` to a concrete API key: provider-local
    /// alias wins, then the global map (spec §3 invariant).
    pub fn resolve_api_key(&self, provider_id: &str, key_id: &str) -> Option<&str> {
        self.per_provider
            .get(provider_id)
            .and_then(|m| m.get(key_id))
            .or_else(|| self.global.get(key_id))
            .map(|s| s.as_str())
    }

    pub fn resolve_oauth(&self, provider_id: &str, key_id: &str) -> Option<&OAuthConfig> {
        self.oauth_aliases.get(provider_id).and_then(|m| m.get(key_id))
    }
}

/// A `{providerId, modelId, keyId}` triple: one entry in a route category's
/// ordered, de-duplicated target list (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider_id: String,
    pub model_id: String,
    pub key_id: String,
}

impl RouteTarget {
    /// Parses `"provider.model[.keyAlias]"`. When the key alias is omitted,
    /// defaults to `"key1"`.
    pub fn parse(spec: &str) -> Option<RouteTarget> {
        let mut parts = spec.splitn(3, '.');
        let provider_id = parts.next()?.to_string();
        let model_id = parts.next()?.to_string();
        let key_id = parts.next().unwrap_or("key1").to_string();
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(RouteTarget { provider_id, model_id, key_id })
    }

    /// The canonical pipeline id this target assembles to: `"{providerId}_{keyId}.{modelId}"`.
    pub fn pipeline_id(&self) -> String {
        format!("{}_{}.{}", self.provider_id, self.key_id, self.model_id)
    }
}

/// A single pipeline's four module declarations (spec §3 PipelineConfig).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDecl {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineModules {
    pub llm_switch: ModuleDecl,
    pub workflow: ModuleDecl,
    pub compatibility: ModuleDecl,
    pub provider: ModuleDecl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub modules: PipelineModules,
    pub target: RouteTarget,
}

/// Everything the Pipeline Assembler (§4.4) needs, produced by
/// `config::process`: route targets, per-pipeline module declarations, and
/// the key/auth mappings backing them.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub pipelines: BTreeMap<String, PipelineConfig>,
    pub routing: BTreeMap<String, Vec<RouteTarget>>,
    pub key_mappings: KeyMappings,
}
