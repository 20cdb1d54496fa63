use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response returned by every endpoint.
/// Each error carries enough information for a client to understand what went
/// wrong and how to recover — including how long to wait, or which sequence
/// number the server last saw.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "stale_progress")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Offending field, when one can be named
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The rejected value, echoed back when it is safe to do so
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
    /// Seconds the client should wait before retrying (rate limits, cooldowns)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const STALE_PROGRESS: &str = "stale_progress";
    pub const EXPIRED: &str = "expired";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const UPSTREAM_FAILED: &str = "upstream_failed";
}
