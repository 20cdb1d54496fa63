use axum::http::Response;
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

type RateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, axum::body::Body>;

/// Rate limit for POST /v1/attempts: 12 starts per minute per IP.
/// Retake policy is the per-owner limit; this one only blunts abuse.
pub fn start_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(5) // 12 per minute = 1 per 5 seconds replenish
            .burst_size(6)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for start"),
    )
    .error_handler(json_error_handler)
}

/// Rate limit for POST /v1/attempts/{id}/submit: 10 requests per minute per IP.
pub fn submit_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(6) // 10 per minute = 1 per 6 seconds replenish
            .burst_size(5)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for submit"),
    )
    .error_handler(json_error_handler)
}

/// Rate limit for PUT /v1/attempts/{id}/progress: 120 requests/minute per IP.
/// Autosave clients write every few seconds.
pub fn progress_write_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_millisecond(500) // 120 per minute = 2 per second replenish
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for progress_write"),
    )
    .error_handler(json_error_handler)
}

/// Rate limit for GET endpoints (progress, report, history): 120/minute per IP.
pub fn read_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_millisecond(500) // 120 per minute = 2 per second replenish
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for read"),
    )
    .error_handler(json_error_handler)
}

/// Render governor denials in the ApiError envelope, with a Retry-After
/// header when the wait is known.
fn json_error_handler(err: GovernorError) -> Response<axum::body::Body> {
    let (status, retry_after, message) = match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            Some(wait_time),
            format!("Rate limit exceeded; retry in {wait_time}s"),
        ),
        GovernorError::UnableToExtractKey => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => (code, None, msg.unwrap_or_default().to_string()),
    };

    let body = serde_json::json!({
        "error": skala_core::error::codes::RATE_LIMITED,
        "message": message,
        "request_id": uuid::Uuid::now_v7().to_string(),
        "retry_after_seconds": retry_after,
    });

    let mut response = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();

    if let Some(seconds) = retry_after {
        if let Ok(value) = seconds.to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
    }

    response
}
