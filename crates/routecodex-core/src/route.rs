use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde_json::Value;

use crate::config::RouteTarget;
use crate::error::{RouteCodexError, Result};

/// `{routeName → [pipelineId, …]}` plus the parallel `{pipelineId →
/// RouteTarget}` index (spec §3 RoutePool). Produced once by the assembler,
/// read by every request thereafter.
#[derive(Debug, Clone, Default)]
pub struct RoutePool {
    pub pools: BTreeMap<String, Vec<String>>,
    pub route_meta: BTreeMap<String, RouteTarget>,
}

/// Request-derived signals the category rules of spec §4.6 match against.
/// `estimated_tokens` is deliberately a conservative heuristic, not an exact
/// tokenizer count — the spec explicitly allows this.
#[derive(Debug, Clone, Default)]
pub struct RouteFeatures {
    pub has_image_content: bool,
    pub estimated_tokens: u64,
    pub max_context: Option<u64>,
    pub thinking_requested: bool,
    pub web_search_hint: bool,
    pub coding_hint: bool,
    pub background_hint: bool,
}

impl RouteFeatures {
    /// Chooses a route category by the first-match-wins rules of spec §4.6.
    pub fn category(&self) -> &'static str {
        if self.has_image_content {
            return "vision";
        }
        if let Some(max_context) = self.max_context {
            // Conservative margin: treat anything past 90% of the model's
            // declared context window as long-context.
            if self.estimated_tokens > (max_context * 9) / 10 {
                return "longContext";
            }
        }
        if self.thinking_requested {
            return "thinking";
        }
        if self.web_search_hint {
            return "webSearch";
        }
        if self.coding_hint {
            return "coding";
        }
        if self.background_hint {
            return "background";
        }
        "default"
    }

    /// Derives route features from a request's metadata `extra` bag and a
    /// rough scan of `data` for image content parts.
    pub fn from_request(data: &Value, metadata_extra: &Value, max_context: Option<u64>) -> Self {
        let has_image_content = contains_image_part(data);
        let estimated_tokens = estimate_tokens(data);
        let thinking_requested = metadata_extra
            .get("thinking")
            .and_then(|v| v.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            || data.get("thinking").and_then(|v| v.get("enabled")).and_then(|v| v.as_bool()).unwrap_or(false);
        let web_search_hint = metadata_extra.get("route_hint").and_then(|v| v.as_str()) == Some("webSearch");
        let coding_hint = metadata_extra.get("route_hint").and_then(|v| v.as_str()) == Some("coding");
        let background_hint = metadata_extra.get("route_hint").and_then(|v| v.as_str()) == Some("background");

        RouteFeatures {
            has_image_content,
            estimated_tokens,
            max_context,
            thinking_requested,
            web_search_hint,
            coding_hint,
            background_hint,
        }
    }
}

fn contains_image_part(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            if let Some(t) = map.get("type").and_then(|v| v.as_str()) {
                if t == "image" || t == "image_url" || t == "input_image" {
                    return true;
                }
            }
            map.values().any(contains_image_part)
        }
        Value::Array(items) => items.iter().any(contains_image_part),
        _ => false,
    }
}

/// A 4-characters-per-token heuristic over the serialized payload; deliberately
/// crude (spec §4.6 explicitly doesn't require exact tokenization).
fn estimate_tokens(value: &Value) -> u64 {
    let serialized = value.to_string();
    (serialized.len() as u64) / 4
}

/// Round-robin cursor plus sticky-session bindings, process-wide mutable
/// state guarded by fine-grained locking (spec §5). One instance is shared
/// by every request.
#[derive(Default)]
pub struct RouteSelector {
    cursors: RwLock<BTreeMap<String, AtomicUsize>>,
    sticky: RwLock<BTreeMap<String, String>>,
    unhealthy: RwLock<std::collections::BTreeSet<String>>,
}

impl RouteSelector {
    pub fn new() -> Self {
        RouteSelector::default()
    }

    pub fn mark_unhealthy(&self, pipeline_id: &str) {
        self.unhealthy.write().unwrap().insert(pipeline_id.to_string());
    }

    fn is_healthy(&self, pipeline_id: &str) -> bool {
        !self.unhealthy.read().unwrap().contains(pipeline_id)
    }

    /// Picks a pipeline id from `pool` for `category`, honoring the sticky
    /// session override of spec §4.6: when `session_id` is set, consecutive
    /// requests sharing it land on the same healthy pipeline; otherwise a
    /// round-robin cursor advances per category. Falls through to `default`
    /// and then the first registered pipeline if the chosen category is empty.
    pub fn select(
        &self,
        pool: &RoutePool,
        category: &str,
        session_id: Option<&str>,
    ) -> Result<String> {
        let candidates = pool
            .pools
            .get(category)
            .filter(|c| !c.is_empty())
            .or_else(|| pool.pools.get("default").filter(|c| !c.is_empty()));

        let candidates = match candidates {
            Some(c) => c,
            None => {
                return pool
                    .pools
                    .values()
                    .flatten()
                    .next()
                    .cloned()
                    .ok_or_else(|| RouteCodexError::RouteMiss { category: category.to_string() });
            }
        };

        if let Some(session_id) = session_id {
            let sticky = self.sticky.read().unwrap();
            if let Some(bound) = sticky.get(session_id) {
                if self.is_healthy(bound) && candidates.contains(bound) {
                    return Ok(bound.clone());
                }
            }
            drop(sticky);
        }

        let healthy: Vec<&String> = candidates.iter().filter(|id| self.is_healthy(id)).collect();
        let pick_from = if healthy.is_empty() { candidates.iter().collect() } else { healthy };
        if pick_from.is_empty() {
            return Err(RouteCodexError::RouteMiss { category: category.to_string() });
        }

        let cursors = self.cursors.read().unwrap();
        let idx = if let Some(cursor) = cursors.get(category) {
            cursor.fetch_add(1, Ordering::Relaxed) % pick_from.len()
        } else {
            drop(cursors);
            self.cursors
                .write()
                .unwrap()
                .entry(category.to_string())
                .or_insert_with(|| AtomicUsize::new(0));
            0
        };
        let chosen = pick_from[idx].clone();

        if let Some(session_id) = session_id {
            self.sticky.write().unwrap().insert(session_id.to_string(), chosen.clone());
        }

        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pool() -> RoutePool {
        let mut pools = BTreeMap::new();
        pools.insert(
            "default".to_string(),
            vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
        );
        RoutePool { pools, route_meta: BTreeMap::new() }
    }

    #[test]
    fn round_robin_advances_across_calls() {
        let selector = RouteSelector::new();
        let pool = sample_pool();
        let first = selector.select(&pool, "default", None).unwrap();
        let second = selector.select(&pool, "default", None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn sticky_session_pins_pipeline_despite_round_robin() {
        let selector = RouteSelector::new();
        let pool = sample_pool();
        let first = selector.select(&pool, "default", Some("resp_42")).unwrap();
        // advance the cursor with unrelated unsticky calls
        selector.select(&pool, "default", None).unwrap();
        selector.select(&pool, "default", None).unwrap();
        let second = selector.select(&pool, "default", Some("resp_42")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sticky_session_fails_over_when_pipeline_unhealthy() {
        let selector = RouteSelector::new();
        let pool = sample_pool();
        let first = selector.select(&pool, "default", Some("s1")).unwrap();
        selector.mark_unhealthy(&first);
        let second = selector.select(&pool, "default", Some("s1")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn vision_category_wins_over_everything_else() {
        let data = serde_json::json!({"content":[{"type":"image_url","image_url":"x"}]});
        let features = RouteFeatures::from_request(&data, &Value::Null, Some(1000));
        assert_eq!(features.category(), "vision");
    }
}
