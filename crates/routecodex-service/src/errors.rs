use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use routecodex_core::error::RouteCodexError;
use serde_json::json;

/// Wraps `RouteCodexError` so handlers can return it directly; renders the
/// `{error:{type, message, code?}}` envelope of spec §6 regardless of which
/// client protocol is talking to us — §6 specifies one shape for every
/// entry point, not a per-dialect error format.
pub struct ApiError(pub RouteCodexError);

impl From<RouteCodexError> for ApiError {
    fn from(err: RouteCodexError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "type": self.0.error_type(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_the_uniform_error_envelope() {
        let err = ApiError(RouteCodexError::RouteMiss { category: "vision".into() });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "route_miss");
        assert!(body["error"]["message"].as_str().unwrap().contains("vision"));
    }
}
