use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use skala_core::error::{self, ApiError};

/// Internal error type that converts to structured API responses.
///
/// The taxonomy matters for clients: `NotFound` is deliberately uniform
/// across "doesn't exist" and "not yours"; `Expired` is distinct from
/// `NotFound` so a client knows to start a new attempt instead of retrying
/// a credential; `StaleProgress` carries the server's `last_seq` so the
/// client can resynchronize.
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or invalid credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Unknown resource, or a resource the caller does not own (404)
    NotFound { resource: String },
    /// State conflict, e.g. resubmission with a different answer set (409)
    Conflict { message: String },
    /// Progress write with a sequence number below the last applied one (409)
    StaleProgress { last_seq: i64 },
    /// Draft past its TTL (410) — restart, don't retry
    Expired { resource: String },
    /// Retake policy violation (429)
    RateLimited {
        message: String,
        retry_after_seconds: Option<i64>,
    },
    /// Scoring engine or content failure (502)
    Upstream { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                    retry_after_seconds: None,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                    retry_after_seconds: None,
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_seconds: None,
                },
            ),
            AppError::Conflict { message } => (
                StatusCode::CONFLICT,
                ApiError {
                    error: error::codes::CONFLICT.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_seconds: None,
                },
            ),
            AppError::StaleProgress { last_seq } => (
                StatusCode::CONFLICT,
                ApiError {
                    error: error::codes::STALE_PROGRESS.to_string(),
                    message: format!(
                        "Progress update is out of order; the server already applied seq {last_seq}"
                    ),
                    field: Some("seq".to_string()),
                    received: Some(serde_json::json!({ "last_seq": last_seq })),
                    request_id,
                    docs_hint: Some(
                        "Re-read progress with GET and resume with a seq greater than last_seq."
                            .to_string(),
                    ),
                    retry_after_seconds: None,
                },
            ),
            AppError::Expired { resource } => (
                StatusCode::GONE,
                ApiError {
                    error: error::codes::EXPIRED.to_string(),
                    message: format!("{resource} has expired"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some("Start a new attempt; this one can no longer be resumed.".to_string()),
                    retry_after_seconds: None,
                },
            ),
            AppError::RateLimited {
                message,
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                ApiError {
                    error: error::codes::RATE_LIMITED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_seconds,
                },
            ),
            AppError::Upstream { message } => {
                tracing::error!("Upstream failure: {message}");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error: error::codes::UPSTREAM_FAILED.to_string(),
                        message: "An upstream dependency failed; the attempt was left unchanged"
                            .to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: Some("Retry the request; nothing was persisted.".to_string()),
                        retry_after_seconds: None,
                    },
                )
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);

                // Unique-constraint violations surface as conflicts, not 500s.
                if let sqlx::Error::Database(ref db_err) = err {
                    if db_err.code().as_deref() == Some("23505") {
                        return AppError::Conflict {
                            message: "The resource already exists".to_string(),
                        }
                        .into_response();
                    }
                }

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                        retry_after_seconds: None,
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                        retry_after_seconds: None,
                    },
                )
            }
        };

        let retry_after = api_error.retry_after_seconds;
        let mut response = (status, Json(api_error)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl AppError {
    /// Unknown attempts and attempts the caller does not own are reported
    /// identically so probing cannot tell them apart.
    pub fn attempt_not_found(attempt_id: uuid::Uuid) -> Self {
        AppError::NotFound {
            resource: format!("attempt '{attempt_id}'"),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;

    use super::AppError;

    #[test]
    fn stale_progress_maps_to_conflict_with_retry_data() {
        let response = AppError::StaleProgress { last_seq: 7 }.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn ownership_failures_are_plain_not_found() {
        // "Not yours" and "doesn't exist" share one shape; there is no
        // separate 403 that would reveal the attempt exists.
        let response = AppError::attempt_not_found(uuid::Uuid::now_v7()).into_response();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn expired_is_distinct_from_not_found() {
        let expired = AppError::Expired {
            resource: "progress draft".to_string(),
        }
        .into_response();
        let missing = AppError::NotFound {
            resource: "attempt".to_string(),
        }
        .into_response();
        assert_eq!(expired.status(), axum::http::StatusCode::GONE);
        assert_eq!(missing.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = AppError::RateLimited {
            message: "cooldown active".to_string(),
            retry_after_seconds: Some(3600),
        }
        .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok()),
            Some("3600")
        );
    }
}
