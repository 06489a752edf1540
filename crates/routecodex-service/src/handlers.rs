use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use routecodex_core::dto::{DebugInfo, RequestDto, RequestMetadata, RouteInfo};
use routecodex_core::error::RouteCodexError;
use routecodex_core::pipeline::{run, RuntimeOutcome};
use routecodex_core::route::RouteFeatures;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::state::AppState;
use crate::streaming;

/// Shared body for all three ingress routes (spec §6): pick a route
/// category and pipeline, run the pipeline, render the result in whichever
/// shape the client asked for. `entry_endpoint` is only a label recorded on
/// the request DTO — the protocol dialect itself is fixed by the pipeline's
/// LLMSwitch, chosen once at assembly time from `inputProtocol`.
async fn handle_entry(state: &AppState, entry_endpoint: &'static str, body: Value) -> Result<Response, ApiError> {
    let want_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let session_id = body
        .get("previous_response_id")
        .or_else(|| body.get("session_id"))
        .and_then(Value::as_str)
        .map(String::from);
    let model = body.get("model").and_then(Value::as_str);
    let max_context = state.max_context_for_model(model);

    let metadata_extra = json!({
        "route_hint": body.get("route_hint").cloned().unwrap_or(Value::Null),
    });
    let features = RouteFeatures::from_request(&body, &metadata_extra, max_context);
    let category = features.category();

    let pipeline_id = state.selector.select(&state.route_pool, category, session_id.as_deref())?;
    let pipeline = state
        .pipelines
        .get(&pipeline_id)
        .ok_or_else(|| RouteCodexError::RouteMiss { category: category.to_string() })?;
    let credential = state
        .credentials
        .get(&pipeline_id)
        .ok_or_else(|| RouteCodexError::AuthUnresolved { provider_id: pipeline_id.clone(), key_id: "?".into() })?;

    let request_id = Uuid::new_v4().to_string();
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64;

    let req = RequestDto {
        data: body,
        route: RouteInfo {
            provider_id: pipeline.target.provider_id.clone(),
            model_id: pipeline.target.model_id.clone(),
            request_id: request_id.clone(),
            timestamp,
        },
        metadata: RequestMetadata {
            entry_endpoint: entry_endpoint.to_string(),
            stream: want_stream,
            session_id,
            extra: Value::Null,
        },
        debug: DebugInfo { enabled: state.snapshots_enabled, stages: Vec::new() },
    };

    tracing::info!(
        pipeline_id = %pipeline_id,
        provider = %pipeline.target.provider_id,
        route = %category,
        request_id = %request_id,
        "dispatching request"
    );

    let outcome = run(pipeline, req, credential.as_ref()).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if matches!(err, RouteCodexError::UpstreamUnavailable { .. }) {
                state.selector.mark_unhealthy(&pipeline_id);
            }
            return Err(ApiError(err));
        }
    };

    match outcome {
        RuntimeOutcome::Buffered(resp) => {
            if state.snapshots_enabled {
                state.record_snapshots(resp.metadata.stages.clone());
            }
            Ok(streaming::render_buffered(resp.data, want_stream))
        }
        RuntimeOutcome::Streaming { response, .. } => {
            let passthrough = pipeline.llm_switch.module_type() == "llmswitch-openai-openai";
            if want_stream && passthrough {
                Ok(streaming::passthrough_sse(response))
            } else {
                let resp =
                    streaming::accumulate_and_convert(pipeline, response, request_id, pipeline_id.clone()).await?;
                Ok(streaming::render_buffered(resp.data, want_stream))
            }
        }
    }
}

pub async fn chat_completions(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match handle_entry(&state, "chat.completions", body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn responses(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match handle_entry(&state, "responses", body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn messages(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match handle_entry(&state, "messages", body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "status": "ok", "pipelines": state.pipelines.len() })).into_response()
}
