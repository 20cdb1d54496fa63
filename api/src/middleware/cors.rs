use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

use crate::auth::{ANON_ID_HEADER, ORG_ID_HEADER, RESUME_TOKEN_HEADER};

/// Build the CORS layer from the configured origin list.
///
/// - Methods: GET, POST, PUT, OPTIONS
/// - Headers: Authorization, Content-Type, and the identity/resume headers
/// - Credentials: allowed
/// - Max age: 3600s
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static(ANON_ID_HEADER),
            HeaderName::from_static(ORG_ID_HEADER),
            HeaderName::from_static(RESUME_TOKEN_HEADER),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}
