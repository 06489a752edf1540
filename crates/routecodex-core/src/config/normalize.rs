use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::{RouteCodexError, Result};

use super::{
    ApiKeyDecl, CompatibilityDecl, ConfigDocument, KeyMappings, ModuleDecl, NormalizedConfig,
    NormalizedProvider, OAuthConfig, OAuthDecl, PipelineConfig, PipelineModules, ProviderDecl,
    RouteTarget,
};

/// Output of `process`: the normalized document plus the assembler-facing
/// config the Pipeline Assembler consumes directly (spec §4.1).
pub struct ProcessOutput {
    pub normalized: NormalizedConfig,
    pub warnings: Vec<String>,
    pub assembler: super::AssemblerConfig,
}

/// Explicit alias table for step 2 of the normalization pipeline. Base-URL
/// heuristics apply only when a provider's declared `type` isn't already
/// canonical and isn't in this table.
fn canonical_type_alias(declared: &str) -> Option<&'static str> {
    match declared {
        "glm" | "zhipu" => Some("glm-http-provider"),
        "openai" => Some("openai-provider"),
        "qwen" => Some("qwen-provider"),
        "anthropic" => Some("anthropic-provider"),
        "lmstudio" | "lm-studio" => Some("lmstudio-provider"),
        "iflow" => Some("iflow-provider"),
        _ => None,
    }
}

/// Base-URL heuristics for providers whose declared `type` didn't match the
/// alias table (spec §4.1 step 2, e.g. GLM's coding-plan endpoint).
fn canonical_type_from_base_url(base_url: &str) -> Option<&'static str> {
    if base_url.contains("open.bigmodel.cn/api/coding/paas") {
        Some("glm-http-provider")
    } else if base_url.contains("open.bigmodel.cn") {
        Some("glm-http-provider")
    } else if base_url.contains("dashscope.aliyuncs.com") {
        Some("qwen-provider")
    } else if base_url.contains("api.anthropic.com") {
        Some("anthropic-provider")
    } else if base_url.contains("localhost") || base_url.contains("127.0.0.1") {
        Some("lmstudio-provider")
    } else {
        None
    }
}

fn is_canonical_type(type_: &str) -> bool {
    type_.ends_with("-provider")
}

/// Parses compatibility shorthand like `"iflow/thinking:enabled"` into the
/// struct form `{type:"iflow-compatibility", config:{thinking:{enabled:true}}}`
/// (spec §4.1 step 4).
fn normalize_compatibility(decl: &CompatibilityDecl) -> ModuleDecl {
    match decl {
        CompatibilityDecl::Explicit { type_, config } => {
            ModuleDecl { type_: type_.clone(), config: config.clone() }
        }
        CompatibilityDecl::Shorthand(s) => {
            let (family, rest) = s.split_once('/').unwrap_or((s.as_str(), ""));
            let (key, value) = rest.split_once(':').unwrap_or((rest, "enabled"));
            let value = match value {
                "enabled" | "true" => Value::Bool(true),
                "disabled" | "false" => Value::Bool(false),
                other => Value::String(other.to_string()),
            };
            ModuleDecl {
                type_: format!("{family}-compatibility"),
                config: json!({ key: { "enabled": value } }),
            }
        }
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Family-default token-file paths used when a config doesn't name one
/// explicitly (spec §4.1 step 5).
fn default_token_file(provider_id: &str, alias: &str, family: &str) -> String {
    let path = match family {
        "qwen" => "~/.qwen/oauth_creds.json".to_string(),
        "iflow" => "~/.iflow/oauth_creds.json".to_string(),
        _ => format!("~/.routecodex/tokens/{provider_id}-{alias}.json"),
    };
    expand_home(&path)
}

fn resolve_oauth(provider_id: &str, alias: &str, decl: &OAuthDecl) -> OAuthConfig {
    let token_file = match &decl.token_file {
        Some(p) => expand_home(p),
        None => default_token_file(provider_id, alias, &decl.family),
    };
    OAuthConfig {
        token_file,
        client_id: decl.client_id.clone(),
        client_secret: decl.client_secret.clone(),
        scopes: decl.scopes.clone(),
        family: decl.family.clone(),
    }
}

/// `process(doc)`: transforms a `ConfigDocument` into `{normalized, warnings,
/// assemblerConfig}` following the six normalization steps of spec §4.1.
/// Fails with `ConfigInvalid` iff a provider, route target, or key alias
/// can't be resolved; heuristic overrides and missing-OAuth-file conditions
/// only emit warnings.
pub fn process(doc: ConfigDocument) -> Result<ProcessOutput> {
    let mut warnings = Vec::new();

    // Step 1: fold legacy top-level `virtualrouter.providers` into `providers`.
    let mut providers: BTreeMap<String, ProviderDecl> = doc.providers;
    if let Some(vr) = doc.virtualrouter {
        for (id, decl) in vr.providers {
            providers.entry(id).or_insert(decl);
        }
    }

    if providers.is_empty() {
        return Err(RouteCodexError::ConfigInvalid("no providers declared".into()));
    }

    let mut normalized_providers = BTreeMap::new();
    let mut key_mappings = KeyMappings::default();

    for (provider_id, decl) in &providers {
        // Step 2: canonicalize provider type.
        let type_ = if is_canonical_type(&decl.type_) {
            decl.type_.clone()
        } else if let Some(alias) = canonical_type_alias(&decl.type_) {
            alias.to_string()
        } else if let Some(heuristic) = canonical_type_from_base_url(&decl.base_url) {
            warnings.push(format!(
                "provider '{provider_id}': inferred type '{heuristic}' from base URL"
            ));
            heuristic.to_string()
        } else {
            return Err(RouteCodexError::ConfigInvalid(format!(
                "provider '{provider_id}': cannot resolve type '{}'",
                decl.type_
            )));
        };

        // Step 3: explode apiKey into key1..keyN.
        let mut keys = BTreeMap::new();
        if let Some(api_key) = &decl.api_key {
            for (i, key) in api_key.clone().into_vec().into_iter().enumerate() {
                keys.insert(format!("key{}", i + 1), key);
            }
        }
        for (alias, key) in &keys {
            key_mappings
                .per_provider
                .entry(provider_id.clone())
                .or_default()
                .insert(alias.clone(), key.clone());
            key_mappings.global.entry(alias.clone()).or_insert_with(|| key.clone());
        }

        // Step 5: resolve OAuth descriptors.
        let mut oauth = BTreeMap::new();
        for (alias, oauth_decl) in &decl.oauth {
            let resolved = resolve_oauth(provider_id, alias, oauth_decl);
            if !std::path::Path::new(&resolved.token_file).exists() {
                warnings.push(format!(
                    "provider '{provider_id}' oauth '{alias}': token file '{}' does not exist yet",
                    resolved.token_file
                ));
            }
            key_mappings
                .oauth_aliases
                .entry(provider_id.clone())
                .or_default()
                .insert(alias.clone(), resolved.clone());
            oauth.insert(alias.clone(), resolved);
        }

        // Step 4: normalize provider-level compatibility shorthand, if present.
        let compatibility = decl.compatibility.clone();

        normalized_providers.insert(
            provider_id.clone(),
            NormalizedProvider {
                id: provider_id.clone(),
                type_,
                base_url: decl.base_url.clone(),
                keys,
                oauth,
                models: decl.models.clone(),
                compatibility,
            },
        );
    }

    // Step 6: routing map already lexically ordered via BTreeMap; validate targets.
    let mut routing: BTreeMap<String, Vec<RouteTarget>> = BTreeMap::new();
    let mut pipelines = BTreeMap::new();

    for (category, targets) in &doc.routing {
        let mut resolved_targets = Vec::new();
        for spec in targets {
            let target = RouteTarget::parse(spec).ok_or_else(|| {
                RouteCodexError::ConfigInvalid(format!(
                    "route category '{category}': malformed target '{spec}'"
                ))
            })?;

            let provider = normalized_providers.get(&target.provider_id).ok_or_else(|| {
                RouteCodexError::ConfigInvalid(format!(
                    "route category '{category}': unknown provider '{}'",
                    target.provider_id
                ))
            })?;

            let is_oauth_alias = provider.oauth.contains_key(&target.key_id);
            let is_api_key_alias = provider.keys.contains_key(&target.key_id)
                || key_mappings.global.contains_key(&target.key_id);
            if !is_oauth_alias && !is_api_key_alias {
                return Err(RouteCodexError::ConfigInvalid(format!(
                    "route category '{category}': key alias '{}' unresolved for provider '{}'",
                    target.key_id, target.provider_id
                )));
            }

            if !resolved_targets.contains(&target) {
                resolved_targets.push(target.clone());
            }

            let pipeline_id = target.pipeline_id();
            pipelines.entry(pipeline_id.clone()).or_insert_with(|| {
                let model_decl = provider.models.get(&target.model_id);
                let compatibility_type = model_decl
                    .and_then(|m| m.compatibility.as_ref())
                    .or(provider.compatibility.as_ref())
                    .map(normalize_compatibility)
                    .unwrap_or_else(|| ModuleDecl {
                        type_: format!("{}-compatibility", provider.type_.trim_end_matches("-provider")),
                        config: Value::Null,
                    });

                PipelineConfig {
                    id: pipeline_id.clone(),
                    modules: PipelineModules {
                        llm_switch: ModuleDecl {
                            type_: doc.input_protocol.default_llm_switch().to_string(),
                            config: Value::Null,
                        },
                        workflow: ModuleDecl {
                            type_: "streaming-control".to_string(),
                            config: json!({ "streamingToNonStreaming": true }),
                        },
                        compatibility: compatibility_type,
                        provider: ModuleDecl { type_: provider.type_.clone(), config: Value::Null },
                    },
                    target: target.clone(),
                }
            });
        }
        routing.insert(category.clone(), resolved_targets);
    }

    let normalized = NormalizedConfig {
        input_protocol: doc.input_protocol,
        output_protocol: doc.output_protocol,
        providers: normalized_providers,
        routing: doc.routing,
    };

    Ok(ProcessOutput {
        normalized,
        warnings,
        assembler: super::AssemblerConfig { pipelines, routing, key_mappings },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelDecl, Protocol};

    fn sample_doc() -> ConfigDocument {
        let mut providers = BTreeMap::new();
        providers.insert(
            "glm".to_string(),
            ProviderDecl {
                type_: "glm".to_string(),
                base_url: "https://open.bigmodel.cn/api/coding/paas/v4".to_string(),
                api_key: Some(ApiKeyDecl::Single("sk-test".to_string())),
                oauth: BTreeMap::new(),
                models: BTreeMap::from([(
                    "glm-4.6".to_string(),
                    ModelDecl { max_tokens: Some(4096), max_context: Some(128000), compatibility: None },
                )]),
                compatibility: None,
            },
        );
        let mut routing = BTreeMap::new();
        routing.insert("default".to_string(), vec!["glm.glm-4.6.key1".to_string()]);

        ConfigDocument {
            input_protocol: Protocol::AnthropicMessages,
            output_protocol: Protocol::OpenaiChat,
            providers,
            routing,
            virtualrouter: None,
        }
    }

    #[test]
    fn canonicalizes_provider_type_and_explodes_key() {
        let out = process(sample_doc()).expect("should normalize");
        let provider = out.normalized.providers.get("glm").unwrap();
        assert_eq!(provider.type_, "glm-http-provider");
        assert_eq!(provider.keys.get("key1").unwrap(), "sk-test");
    }

    #[test]
    fn rejects_unresolvable_route_target() {
        let mut doc = sample_doc();
        doc.routing.insert("default".to_string(), vec!["glm.glm-4.6.key9".to_string()]);
        let err = process(doc).unwrap_err();
        assert!(matches!(err, RouteCodexError::ConfigInvalid(_)));
    }

    #[test]
    fn pipeline_id_is_canonical() {
        let out = process(sample_doc()).expect("should normalize");
        assert!(out.assembler.pipelines.contains_key("glm_key1.glm-4.6"));
    }
}
