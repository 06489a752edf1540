use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use routecodex_core::auth::CredentialResolver;
use routecodex_core::config::{NormalizedConfig, Protocol};
use routecodex_core::dto::StageSnapshot;
use routecodex_core::pipeline::Pipeline;
use routecodex_core::route::RoutePool;
use routecodex_core::route::RouteSelector;

/// Default capacity of `AppState::snapshot_ring` (SPEC_FULL.md §G).
const SNAPSHOT_RING_CAPACITY: usize = 200;

/// Everything the HTTP handlers need, built once at startup by `assemble()`
/// and shared read-only across every request (spec §5 "pipeline instances:
/// shared read-only after assembly").
pub struct AppState {
    pub pipelines: HashMap<String, Arc<Pipeline>>,
    pub credentials: HashMap<String, Arc<dyn CredentialResolver>>,
    pub route_pool: RoutePool,
    pub selector: RouteSelector,
    pub normalized: NormalizedConfig,
    pub input_protocol: Protocol,
    pub snapshots_enabled: bool,
    /// Bounded, process-wide history of stage snapshots across requests
    /// (SPEC_FULL.md §G), in place of the full debug UI the spec scopes out.
    pub snapshot_ring: Mutex<VecDeque<StageSnapshot>>,
}

impl AppState {
    /// Looks up the `maxContext` declared for a model name across every
    /// normalized provider, used by `RouteFeatures::from_request` (spec
    /// §4.6's `longContext` rule) before a pipeline has been chosen.
    pub fn max_context_for_model(&self, model: Option<&str>) -> Option<u64> {
        let model = model?;
        self.normalized
            .providers
            .values()
            .find_map(|p| p.models.get(model))
            .and_then(|m| m.max_context)
    }

    /// Appends a request's stage snapshots to the ring buffer, evicting the
    /// oldest entries once `SNAPSHOT_RING_CAPACITY` is exceeded.
    pub fn record_snapshots(&self, stages: Vec<StageSnapshot>) {
        if stages.is_empty() {
            return;
        }
        let mut ring = self.snapshot_ring.lock().expect("snapshot ring mutex poisoned");
        ring.extend(stages);
        while ring.len() > SNAPSHOT_RING_CAPACITY {
            ring.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use routecodex_core::config::{ModelDecl, NormalizedConfig, NormalizedProvider, Protocol};

    use super::*;

    fn normalized_with_one_model(model: &str, max_context: Option<u64>) -> NormalizedConfig {
        let mut models = BTreeMap::new();
        models.insert(model.to_string(), ModelDecl { max_tokens: None, max_context, compatibility: None });
        let mut providers = BTreeMap::new();
        providers.insert(
            "p1".to_string(),
            NormalizedProvider {
                id: "p1".into(),
                type_: "openai-provider".into(),
                base_url: "https://example.test".into(),
                keys: BTreeMap::new(),
                oauth: BTreeMap::new(),
                models,
                compatibility: None,
            },
        );
        NormalizedConfig {
            input_protocol: Protocol::OpenaiChat,
            output_protocol: Protocol::OpenaiChat,
            providers,
            routing: BTreeMap::new(),
        }
    }

    #[test]
    fn looks_up_max_context_across_providers() {
        let normalized = normalized_with_one_model("gpt-x", Some(128_000));
        let state = AppState {
            pipelines: HashMap::new(),
            credentials: HashMap::new(),
            route_pool: routecodex_core::route::RoutePool::default(),
            selector: routecodex_core::route::RouteSelector::new(),
            normalized,
            input_protocol: Protocol::OpenaiChat,
            snapshots_enabled: false,
            snapshot_ring: Mutex::new(VecDeque::new()),
        };
        assert_eq!(state.max_context_for_model(Some("gpt-x")), Some(128_000));
        assert_eq!(state.max_context_for_model(Some("unknown")), None);
        assert_eq!(state.max_context_for_model(None), None);
    }

    #[test]
    fn snapshot_ring_evicts_oldest_once_at_capacity() {
        let normalized = normalized_with_one_model("gpt-x", None);
        let state = AppState {
            pipelines: HashMap::new(),
            credentials: HashMap::new(),
            route_pool: routecodex_core::route::RoutePool::default(),
            selector: routecodex_core::route::RouteSelector::new(),
            normalized,
            input_protocol: Protocol::OpenaiChat,
            snapshots_enabled: true,
            snapshot_ring: Mutex::new(VecDeque::new()),
        };

        for i in 0..(SNAPSHOT_RING_CAPACITY + 10) {
            state.record_snapshots(vec![StageSnapshot {
                module: format!("module-{i}"),
                direction: routecodex_core::dto::StageDirection::Incoming,
                snapshot: serde_json::json!({ "i": i }),
            }]);
        }

        let ring = state.snapshot_ring.lock().unwrap();
        assert_eq!(ring.len(), SNAPSHOT_RING_CAPACITY);
        assert_eq!(ring.front().unwrap().module, "module-10");
        assert_eq!(ring.back().unwrap().module, format!("module-{}", SNAPSHOT_RING_CAPACITY + 9));
    }
}
