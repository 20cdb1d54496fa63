use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod cache;
mod config;
mod drafts;
mod entitlements;
mod error;
mod extract;
mod middleware;
mod packs;
mod recorder;
mod report_gate;
mod retake;
mod routes;
mod scoring;
mod sideeffects;
mod snapshots;
mod state;
mod submit;
#[cfg(test)]
mod testing;
mod wallet;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Skala Assessment API",
        version = "0.1.0",
        description = "Attempt lifecycle and submission service for personality questionnaires: resumable drafts, idempotent submits, entitlement-gated reports."
    ),
    paths(
        routes::health::health_check,
        routes::attempts::start_attempt,
        routes::attempts::submit_attempt,
        routes::attempts::redact_attempt,
        routes::attempts::list_attempts,
        routes::progress::save_progress,
        routes::progress::get_progress,
        routes::reports::get_report,
    ),
    components(schemas(
        HealthResponse,
        skala_core::error::ApiError,
        skala_core::answers::AnswerEntry,
        skala_core::attempt::StartAttemptRequest,
        skala_core::attempt::StartAttemptResponse,
        skala_core::attempt::SubmitAttemptRequest,
        skala_core::attempt::SubmitAttemptResponse,
        skala_core::attempt::RedactAttemptResponse,
        skala_core::attempt::AttemptListItem,
        skala_core::attempt::PaginatedResponse<skala_core::attempt::AttemptListItem>,
        skala_core::progress::SaveProgressRequest,
        skala_core::progress::ProgressSnapshot,
        skala_core::report::ReportAccess,
        skala_core::report::ReportStatus,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// How often expired drafts are evicted from the in-process cache.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skala_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::AppConfig::from_env().expect("invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let port = config.port;
    let cors_layer = middleware::cors::build_cors_layer(&config.cors_origins);
    let app_state = state::AppState::new(pool, config);

    // Expired drafts are refused on read; the sweep just reclaims memory.
    let sweep_cache = app_state.drafts.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = sweep_cache.sweep().await;
            if evicted > 0 {
                tracing::debug!(evicted, "swept expired drafts from cache");
            }
        }
    });

    // Router with per-endpoint-class rate limiting
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::attempts::start_router().layer(middleware::rate_limit::start_layer()))
        .merge(routes::attempts::submit_router().layer(middleware::rate_limit::submit_layer()))
        .merge(routes::attempts::manage_router().layer(middleware::rate_limit::read_layer()))
        .merge(
            routes::progress::write_router().layer(middleware::rate_limit::progress_write_layer()),
        )
        .merge(routes::progress::read_router().layer(middleware::rate_limit::read_layer()))
        .merge(routes::reports::router().layer(middleware::rate_limit::read_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Skala API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
