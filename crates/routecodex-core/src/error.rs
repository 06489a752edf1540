use std::fmt;

/// Error taxonomy shared by every module in the pipeline (spec §7). These are
/// categories, not a 1:1 mapping onto Rust's `std::error::Error` hierarchy, so
/// the enum stays flat rather than wrapping per-module error types.
#[derive(Debug)]
pub enum RouteCodexError {
    ConfigInvalid(String),
    AuthUnresolved { provider_id: String, key_id: String },
    AuthExpired { provider_id: String },
    /// Upstream itself rejected the credential (401/403), as opposed to
    /// `AuthUnresolved`/`AuthExpired` which are raised before a request ever
    /// leaves the proxy (spec §4.7 "401/403 → `AuthError`").
    AuthError { provider_id: String, detail: String },
    RouteMiss { category: String },
    ConversionFailed { kind: ConversionFailureKind, detail: String },
    UpstreamRejected { status: u16, detail: String },
    UpstreamUnavailable { status: u16, detail: String },
    NetworkError(String),
    Timeout,
    RequestCancelled,
    ToolExecutionError(String),
}

/// `ConversionFailed` is further split per spec §7: a `parse-error` means the
/// upstream payload itself was malformed; `schema-violation` means it parsed
/// but didn't have the shape a codec expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionFailureKind {
    ParseError,
    SchemaViolation,
}

impl fmt::Display for ConversionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionFailureKind::ParseError => write!(f, "parse-error"),
            ConversionFailureKind::SchemaViolation => write!(f, "schema-violation"),
        }
    }
}

impl fmt::Display for RouteCodexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteCodexError::ConfigInvalid(msg) => write!(f, "config invalid: {msg}"),
            RouteCodexError::AuthUnresolved { provider_id, key_id } => {
                write!(f, "auth unresolved for {provider_id}/{key_id}")
            }
            RouteCodexError::AuthExpired { provider_id } => {
                write!(f, "auth expired for provider {provider_id}")
            }
            RouteCodexError::AuthError { provider_id, detail } => {
                write!(f, "upstream rejected auth for provider {provider_id}: {detail}")
            }
            RouteCodexError::RouteMiss { category } => {
                write!(f, "no pipeline available for route category '{category}'")
            }
            RouteCodexError::ConversionFailed { kind, detail } => {
                write!(f, "conversion failed ({kind}): {detail}")
            }
            RouteCodexError::UpstreamRejected { status, detail } => {
                write!(f, "upstream rejected request ({status}): {detail}")
            }
            RouteCodexError::UpstreamUnavailable { status, detail } => {
                write!(f, "upstream unavailable ({status}): {detail}")
            }
            RouteCodexError::NetworkError(msg) => write!(f, "network error: {msg}"),
            RouteCodexError::Timeout => write!(f, "request timed out"),
            RouteCodexError::RequestCancelled => write!(f, "request cancelled"),
            RouteCodexError::ToolExecutionError(msg) => write!(f, "tool execution error: {msg}"),
        }
    }
}

impl std::error::Error for RouteCodexError {}

impl From<reqwest::Error> for RouteCodexError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RouteCodexError::Timeout
        } else {
            RouteCodexError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RouteCodexError {
    fn from(err: serde_json::Error) -> Self {
        RouteCodexError::ConversionFailed {
            kind: ConversionFailureKind::ParseError,
            detail: err.to_string(),
        }
    }
}

impl From<url::ParseError> for RouteCodexError {
    fn from(err: url::ParseError) -> Self {
        RouteCodexError::ConfigInvalid(format!("invalid URL: {err}"))
    }
}

impl RouteCodexError {
    /// Maps an error category to the HTTP status an external HTTP handler
    /// should use for a non-streaming client (spec §7: "`AuthError` → 401,
    /// `RouteMiss` → 503, `Timeout` → 504, `UpstreamUnavailable` → 502, else
    /// 500"). `AuthUnresolved`/`AuthExpired` are auth failures too and are
    /// folded into the same 401 bucket as `AuthError`.
    pub fn http_status(&self) -> u16 {
        match self {
            RouteCodexError::AuthError { .. }
            | RouteCodexError::AuthUnresolved { .. }
            | RouteCodexError::AuthExpired { .. } => 401,
            RouteCodexError::RouteMiss { .. } => 503,
            RouteCodexError::Timeout => 504,
            RouteCodexError::UpstreamUnavailable { .. } => 502,
            RouteCodexError::ToolExecutionError(_) => 200,
            RouteCodexError::ConfigInvalid(_)
            | RouteCodexError::ConversionFailed { .. }
            | RouteCodexError::UpstreamRejected { .. }
            | RouteCodexError::NetworkError(_)
            | RouteCodexError::RequestCancelled => 500,
        }
    }

    /// The stable `type` field used in the client-dialect error envelope (§7).
    pub fn error_type(&self) -> &'static str {
        match self {
            RouteCodexError::ConfigInvalid(_) => "config_invalid",
            RouteCodexError::AuthUnresolved { .. } => "auth_unresolved",
            RouteCodexError::AuthExpired { .. } => "auth_expired",
            RouteCodexError::AuthError { .. } => "auth_error",
            RouteCodexError::RouteMiss { .. } => "route_miss",
            RouteCodexError::ConversionFailed { .. } => "conversion_failed",
            RouteCodexError::UpstreamRejected { .. } => "upstream_rejected",
            RouteCodexError::UpstreamUnavailable { .. } => "upstream_unavailable",
            RouteCodexError::NetworkError(_) => "network_error",
            RouteCodexError::Timeout => "timeout",
            RouteCodexError::RequestCancelled => "request_cancelled",
            RouteCodexError::ToolExecutionError(_) => "tool_execution_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteCodexError>;
