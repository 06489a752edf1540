use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::auth::{resolve_auth, CredentialResolver, OAuthManager, ResolvedAuth, StaticKeyResolver};
use crate::config::{AssemblerConfig, KeyMappings, ModuleDecl, NormalizedConfig, RouteTarget};
use crate::error::{RouteCodexError, Result};
use crate::route::RoutePool;

use super::provider::HttpProviderModule;
use super::{Pipeline, PipelineModule};

/// A module constructor keyed by module `type` string, registered ahead of
/// assembly time (spec §9: "module registration happens through a
/// name-to-factory table; no runtime subclassing"). `routecodex-codecs`
/// supplies the concrete LLMSwitch/Workflow/Compatibility factories; this
/// crate never references that crate directly to avoid a dependency cycle.
pub type ModuleFactory = Arc<dyn Fn(&ModuleDecl) -> Result<Arc<dyn PipelineModule>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ModuleFactories {
    pub llm_switch: HashMap<String, ModuleFactory>,
    pub workflow: HashMap<String, ModuleFactory>,
    pub compatibility: HashMap<String, ModuleFactory>,
}

impl ModuleFactories {
    pub fn register_llm_switch(&mut self, type_: impl Into<String>, factory: ModuleFactory) {
        self.llm_switch.insert(type_.into(), factory);
    }

    pub fn register_workflow(&mut self, type_: impl Into<String>, factory: ModuleFactory) {
        self.workflow.insert(type_.into(), factory);
    }

    pub fn register_compatibility(&mut self, type_: impl Into<String>, factory: ModuleFactory) {
        self.compatibility.insert(type_.into(), factory);
    }
}

/// A provider whose base-URL host matches another's, used for the
/// assembly-time key fallback of spec §4.4 step 3 ("base-URL host match
/// across all providers, to recover a shared key").
fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
}

fn resolve_auth_with_fallback(
    target: &RouteTarget,
    mappings: &KeyMappings,
    normalized: &NormalizedConfig,
) -> Result<ResolvedAuth> {
    match resolve_auth(&target.provider_id, &target.key_id, mappings) {
        Ok(auth) => Ok(auth),
        Err(err) => {
            let this_host = normalized
                .providers
                .get(&target.provider_id)
                .and_then(|p| host_of(&p.base_url));
            let Some(this_host) = this_host else { return Err(err) };

            for (other_id, provider) in &normalized.providers {
                if other_id == &target.provider_id {
                    continue;
                }
                if host_of(&provider.base_url).as_deref() != Some(this_host.as_str()) {
                    continue;
                }
                if let Ok(auth) = resolve_auth(other_id, &target.key_id, mappings) {
                    return Ok(auth);
                }
            }
            Err(err)
        }
    }
}

fn provider_path_for(type_: &str) -> &'static str {
    match type_ {
        "anthropic-provider" => "/v1/messages",
        _ => "/v1/chat/completions",
    }
}

/// Implements the five-step assembly algorithm of spec §4.4: resolve module
/// types, resolve concrete auth, instantiate and initialize modules, and
/// reconcile route pools against whatever actually registered.
pub async fn assemble(
    assembler: &AssemblerConfig,
    normalized: &NormalizedConfig,
    factories: &ModuleFactories,
) -> Result<(HashMap<String, Arc<Pipeline>>, HashMap<String, Arc<dyn CredentialResolver>>, RoutePool)> {
    let mut registry = HashMap::new();
    let mut auths = HashMap::new();

    for (pipeline_id, config) in &assembler.pipelines {
        let provider = normalized.providers.get(&config.target.provider_id).ok_or_else(|| {
            RouteCodexError::ConfigInvalid(format!(
                "pipeline '{pipeline_id}': unknown provider '{}'",
                config.target.provider_id
            ))
        })?;

        // Step 3: resolve concrete auth (direct, falling back to a shared
        // base-URL host match across providers).
        let auth = match resolve_auth_with_fallback(&config.target, &assembler.key_mappings, normalized) {
            Ok(auth) => auth,
            Err(err) => {
                tracing::warn!(pipeline_id = %pipeline_id, error = %err, "dropping pipeline: auth unresolved");
                continue;
            }
        };

        // Step 1 & 2: module types are already resolved onto `config.modules`
        // by `config::process`; look up factories by that type string.
        let llm_switch = match factories.llm_switch.get(&config.modules.llm_switch.type_) {
            Some(f) => f(&config.modules.llm_switch)?,
            None => {
                tracing::warn!(pipeline_id = %pipeline_id, type_ = %config.modules.llm_switch.type_, "dropping pipeline: no llmSwitch factory");
                continue;
            }
        };
        let workflow = match factories.workflow.get(&config.modules.workflow.type_) {
            Some(f) => f(&config.modules.workflow)?,
            None => {
                tracing::warn!(pipeline_id = %pipeline_id, type_ = %config.modules.workflow.type_, "dropping pipeline: no workflow factory");
                continue;
            }
        };
        let compatibility = match factories.compatibility.get(&config.modules.compatibility.type_) {
            Some(f) => f(&config.modules.compatibility)?,
            None => {
                tracing::warn!(pipeline_id = %pipeline_id, type_ = %config.modules.compatibility.type_, "dropping pipeline: no compatibility factory");
                continue;
            }
        };

        let provider_module: Arc<dyn super::ProviderModule> = Arc::new(HttpProviderModule::new(
            provider.type_.clone(),
            provider.base_url.clone(),
            provider_path_for(&provider.type_),
        ));

        // Step 4: initialize in dependency order, register under canonical id.
        llm_switch.initialize().await?;
        workflow.initialize().await?;
        compatibility.initialize().await?;
        provider_module.initialize().await?;

        let credential: Arc<dyn CredentialResolver> = match auth {
            ResolvedAuth::ApiKey { api_key } => Arc::new(StaticKeyResolver::new(api_key)),
            ResolvedAuth::OAuth { oauth } => Arc::new(OAuthManager::new(oauth)),
        };
        auths.insert(pipeline_id.clone(), credential);
        registry.insert(
            pipeline_id.clone(),
            Arc::new(Pipeline {
                id: pipeline_id.clone(),
                target: config.target.clone(),
                llm_switch,
                workflow,
                compatibility,
                provider: provider_module,
            }),
        );
    }

    // Step 5: reconcile route pools against whatever actually registered.
    let mut pools: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut route_meta: BTreeMap<String, RouteTarget> = BTreeMap::new();

    for (category, targets) in &assembler.routing {
        let mut ids = Vec::new();
        for target in targets {
            let pid = target.pipeline_id();
            if registry.contains_key(&pid) {
                if !ids.contains(&pid) {
                    ids.push(pid.clone());
                }
                route_meta.insert(pid, target.clone());
            }
        }

        if ids.is_empty() {
            // Fill from the first available pipeline of the same provider family.
            if let Some(first_target) = targets.first() {
                if let Some((pid, pipeline)) = registry
                    .iter()
                    .find(|(_, p)| p.target.provider_id == first_target.provider_id)
                {
                    ids.push(pid.clone());
                    route_meta.insert(pid.clone(), pipeline.target.clone());
                }
            }
        }

        pools.insert(category.clone(), ids);
    }

    if pools.values().all(Vec::is_empty) {
        if let Some((pid, pipeline)) = registry.iter().next() {
            pools.insert("default".to_string(), vec![pid.clone()]);
            route_meta.insert(pid.clone(), pipeline.target.clone());
        }
    }

    if registry.is_empty() {
        return Err(RouteCodexError::ConfigInvalid(
            "no pipeline could be assembled from the supplied configuration".to_string(),
        ));
    }

    Ok((registry, auths, RoutePool { pools, route_meta }))
}
