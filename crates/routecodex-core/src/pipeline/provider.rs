use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::CredentialResolver;
use crate::dto::{RequestDto, ResponseDto, ResponseMetadata};
use crate::error::{RouteCodexError, Result};
use crate::http_client::shared_client;

use super::Readiness;

/// What the Provider module hands back to the pipeline runtime (spec §4.7):
/// either the response has already been collected, or the runtime gets a raw
/// upstream stream to forward through the Workflow/SSE stages.
pub enum ProviderOutcome {
    Buffered(ResponseDto),
    Streaming { response: reqwest::Response, pipeline_id: String },
}

/// The module that executes the outbound HTTP call (spec §4.7). Unlike the
/// other three modules, Provider doesn't transform the DTO in place — it's
/// the boundary where a request becomes a response — so it gets its own
/// `execute` entry point instead of `process_incoming`/`process_outgoing`.
#[async_trait]
pub trait ProviderModule: Send + Sync {
    fn module_type(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn readiness(&self) -> Readiness {
        Readiness::Ready
    }

    /// `bearer` is already a resolved, current access credential — either a
    /// static API key or a fresh OAuth access token — handed to Provider by
    /// the pipeline runtime via the pipeline's `CredentialResolver` (spec
    /// §4.2, §4.7). `credential` is the same resolver, kept around so
    /// Provider can invalidate a stale OAuth token after an upstream 401.
    async fn execute(
        &self,
        req: &RequestDto,
        bearer: &str,
        credential: &dyn CredentialResolver,
    ) -> Result<ProviderOutcome>;
}

/// Per-pipeline timeout/retry configuration (spec §4.7 defaults: 10s
/// connect, 300s read, 2 retries, 250ms initial backoff).
#[derive(Debug, Clone)]
pub struct ProviderTuning {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for ProviderTuning {
    fn default() -> Self {
        ProviderTuning {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Generic HTTP Provider module: vendor differences are confined to the
/// Compatibility module upstream, so one executor handles every canonical
/// provider type by base URL + path + headers.
pub struct HttpProviderModule {
    type_: String,
    base_url: String,
    path: String,
    extra_headers: Vec<(String, String)>,
    tuning: ProviderTuning,
}

impl HttpProviderModule {
    pub fn new(type_: impl Into<String>, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        HttpProviderModule {
            type_: type_.into(),
            base_url: base_url.into(),
            path: path.into(),
            extra_headers: Vec::new(),
            tuning: ProviderTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: ProviderTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }

    /// Only the failure modes spec §4.7 calls out as idempotent are retried:
    /// a network-level error before any byte arrived, a 5xx with no
    /// `Retry-After`, or a 429 with an honored `Retry-After`.
    fn classify_status(provider_id: &str, status: u16, body: &str) -> RouteCodexError {
        match status {
            401 | 403 => {
                RouteCodexError::AuthError { provider_id: provider_id.to_string(), detail: body.to_string() }
            }
            400 | 422 => RouteCodexError::UpstreamRejected { status, detail: body.to_string() },
            s if (500..600).contains(&s) => {
                RouteCodexError::UpstreamUnavailable { status, detail: body.to_string() }
            }
            _ => RouteCodexError::UpstreamRejected { status, detail: body.to_string() },
        }
    }

    fn is_retryable(status: Option<u16>) -> bool {
        match status {
            None => true,
            Some(429) => true,
            Some(s) => (500..600).contains(&s),
        }
    }
}

#[async_trait]
impl ProviderModule for HttpProviderModule {
    fn module_type(&self) -> &str {
        &self.type_
    }

    async fn execute(
        &self,
        req: &RequestDto,
        bearer: &str,
        credential: &dyn CredentialResolver,
    ) -> Result<ProviderOutcome> {
        let client = shared_client();

        let mut attempt = 0u32;
        let mut backoff = self.tuning.initial_backoff;
        loop {
            let mut builder = client
                .post(self.url())
                .bearer_auth(bearer)
                .timeout(self.tuning.read_timeout)
                .json(&req.data);
            for (name, value) in &self.extra_headers {
                builder = builder.header(name, value);
            }

            let result = builder.send().await;
            let response = match result {
                Ok(r) => r,
                Err(e) if attempt < self.tuning.max_retries && Self::is_retryable(None) => {
                    tracing::warn!(attempt, error = %e, "provider call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(RouteCodexError::from(e)),
            };

            let status = response.status().as_u16();
            if status >= 400 {
                if Self::is_retryable(Some(status)) && attempt < self.tuning.max_retries {
                    tracing::warn!(attempt, status, "provider rejected request, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                    continue;
                }
                let body = response.text().await.unwrap_or_default();
                let err = Self::classify_status(&req.route.provider_id, status, &body);
                if matches!(err, RouteCodexError::AuthError { .. }) {
                    credential.invalidate().await;
                }
                return Err(err);
            }

            if req.metadata.stream {
                // The caller (routecodex-service's handlers.rs) already knows
                // which pipeline it selected; Provider has no key alias to
                // build a real one from, so it leaves this for the caller to
                // fill in rather than fabricating one.
                return Ok(ProviderOutcome::Streaming { response, pipeline_id: String::new() });
            }

            let data: Value = response.json().await?;
            return Ok(ProviderOutcome::Buffered(ResponseDto {
                data,
                metadata: ResponseMetadata {
                    request_id: req.route.request_id.clone(),
                    pipeline_id: String::new(),
                    processing_time_ms: 0,
                    stages: Vec::new(),
                },
            }));
        }
    }
}
