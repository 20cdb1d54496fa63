//! Request extractors that keep rejections inside the error envelope.
//!
//! Use `AppJson<T>` instead of `axum::Json<T>` in handler signatures so that
//! deserialization failures produce the JSON `ApiError` envelope instead of
//! axum's plain-text 422.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

/// JSON extractor that converts deserialization errors to structured
/// `AppError::Validation` responses.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| AppJson(value))
            .map_err(map_json_rejection)
    }
}

/// Convert a `JsonRejection` to a structured `AppError::Validation`.
pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let detail = rejection.body_text();
    let field = extract_field_from_serde_message(&detail).unwrap_or_else(|| "body".to_string());

    AppError::Validation {
        message: format!("Invalid request body: {detail}"),
        field: Some(field),
        received: None,
        docs_hint: Some(
            "Check the request body against the endpoint schema (GET /api-doc/openapi.json)."
                .to_string(),
        ),
    }
}

/// Pull the offending field name out of serde's "missing field `x`" /
/// "unknown field `x`" messages.
fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    for pattern in ["missing field `", "unknown field `"] {
        if let Some(start) = msg.find(pattern) {
            let rest = &msg[start + pattern.len()..];
            if let Some(end) = rest.find('`') {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}
