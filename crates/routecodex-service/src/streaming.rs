use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream as futures_stream;
use futures::StreamExt;
use routecodex_codecs::sse::{is_terminal, ChatAccumulator, DialectAccumulator, ResponsesAccumulator, SseDecoder, SseEvent};
use routecodex_core::dto::{ResponseDto, ResponseMetadata};
use routecodex_core::error::{Result, RouteCodexError};
use routecodex_core::pipeline::Pipeline;
use serde_json::{json, Value};

/// Re-emits the raw upstream SSE byte stream as axum `Event`s unmodified —
/// used when the client's entry protocol is already the canonical
/// OpenAI-Chat dialect Provider speaks, so no per-event translation is
/// needed (spec §4.5's "pass-through" path, §5's one-event-at-a-time
/// backpressure coupling).
pub fn passthrough_sse(response: reqwest::Response) -> Response {
    let event_stream = response
        .bytes_stream()
        .scan(SseDecoder::new(), |decoder, chunk| {
            let events = match chunk {
                Ok(bytes) => decoder.feed(&bytes),
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream read failed");
                    vec![SseEvent {
                        event: None,
                        data: json!({ "error": { "message": e.to_string(), "type": "network_error" } })
                            .to_string(),
                    }]
                }
            };
            futures::future::ready(Some(events))
        })
        .flat_map(|events| {
            let rendered: Vec<std::result::Result<Event, Infallible>> = events
                .into_iter()
                .map(|e| {
                    let mut event = Event::default().data(e.data);
                    if let Some(name) = e.event {
                        event = event.event(name);
                    }
                    Ok(event)
                })
                .collect();
            futures_stream::iter(rendered)
        });

    Sse::new(event_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

/// Drains an upstream SSE stream whose dialect doesn't match the client's
/// (spec §4.5 "Workflow delegates accumulation to the SSE→JSON converter
/// before returning"), then runs the accumulated JSON back through the
/// pipeline's reverse traversal so it lands in the client's protocol.
pub async fn accumulate_and_convert(
    pipeline: &Pipeline,
    response: reqwest::Response,
    request_id: String,
    pipeline_id: String,
) -> Result<ResponseDto> {
    let mut decoder = SseDecoder::new();
    let mut accumulator = if pipeline.llm_switch.module_type() == "llmswitch-response-chat" {
        DialectAccumulator::Responses(ResponsesAccumulator::new())
    } else {
        DialectAccumulator::Chat(ChatAccumulator::new())
    };
    let mut byte_stream = response.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(RouteCodexError::from)?;
        for event in decoder.feed(&chunk) {
            // `response.completed` carries the final Responses-dialect
            // payload itself, so it must reach the accumulator before the
            // loop stops; `[DONE]` carries nothing and is only a stop signal.
            let stop = is_terminal(&event);
            if event.data.trim() != "[DONE]" {
                accumulator.push(&event);
            }
            if stop {
                break 'outer;
            }
        }
    }

    let mut resp = ResponseDto {
        data: accumulator.finish(),
        metadata: ResponseMetadata { request_id, pipeline_id, processing_time_ms: 0, stages: Vec::new() },
    };
    resp = pipeline.compatibility.process_outgoing(resp).await?;
    resp = pipeline.workflow.process_outgoing(resp).await?;
    resp = pipeline.llm_switch.process_outgoing(resp).await?;
    Ok(resp)
}

/// Renders a buffered response: JSON when the client didn't ask to stream,
/// a synthetic one-shot SSE stream otherwise (spec §4.5 step 4 — the
/// re-synthesis side of a streaming-to-non-streaming downgrade).
pub fn render_buffered(data: Value, want_stream: bool) -> Response {
    if !want_stream {
        return axum::Json(data).into_response();
    }
    synthesize_sse_from_value(data)
}

fn synthesize_sse_from_value(data: Value) -> Response {
    let chunk = Event::default().data(data.to_string());
    let done = Event::default().data("[DONE]");
    let stream = futures_stream::iter(vec![Ok::<_, Infallible>(chunk), Ok(done)]);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn render_buffered_returns_plain_json_when_not_streaming() {
        let data = json!({"id": "chatcmpl-1"});
        let response = render_buffered(data.clone(), false);
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn render_buffered_synthesizes_sse_when_streaming() {
        let data = json!({"id": "chatcmpl-1"});
        let response = render_buffered(data, true);
        assert_eq!(
            response.headers().get(axum::http::header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("chatcmpl-1"));
        assert!(text.contains("[DONE]"));
    }
}
