use axum::extract::{Path, Query, State};
use axum::{Json, Router, routing::get};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use skala_core::error::ApiError;
use skala_core::report::ReportAccess;

use crate::auth::Caller;
use crate::error::AppError;
use crate::report_gate;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/attempts/{attempt_id}/report", get(get_report))
}

/// Query parameters for report access
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ReportParams {
    /// Force a re-render before waiting (e.g. after a failed generation)
    #[serde(default)]
    pub refresh: Option<bool>,
}

/// Fetch the attempt's report
///
/// Holds the request for up to the configured wait while generation runs;
/// a render that outlives the wait answers `processing` with a poll hint.
/// Unentitled callers get `locked` without learning whether a report
/// exists.
#[utoipa::path(
    get,
    path = "/v1/attempts/{attempt_id}/report",
    params(
        ("attempt_id" = Uuid, Path, description = "Submitted attempt"),
        ReportParams
    ),
    responses(
        (status = 200, description = "Report payload or gate status", body = ReportAccess),
        (status = 404, description = "Attempt unknown or not owned by the caller", body = ApiError),
        (status = 409, description = "Attempt not yet submitted", body = ApiError)
    ),
    tag = "reports"
)]
pub async fn get_report(
    State(state): State<AppState>,
    caller: Caller,
    Path(attempt_id): Path<Uuid>,
    Query(params): Query<ReportParams>,
) -> Result<Json<ReportAccess>, AppError> {
    let identity = caller.require_owner()?;

    let row = sqlx::query_as::<_, ReportTargetRow>(
        r#"
        SELECT user_id, anon_id, submitted_at, redacted_at
        FROM attempts
        WHERE id = $1 AND org_id = $2
        "#,
    )
    .bind(attempt_id)
    .bind(identity.org_id)
    .fetch_optional(&state.db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::attempt_not_found(attempt_id))?;

    if !identity.owns(row.user_id, row.anon_id.as_deref()) || row.redacted_at.is_some() {
        return Err(AppError::attempt_not_found(attempt_id));
    }
    if row.submitted_at.is_none() {
        return Err(AppError::Conflict {
            message: "Attempt has not been submitted; no report exists yet".to_string(),
        });
    }

    let access = report_gate::resolve(
        &state,
        identity.org_id,
        attempt_id,
        params.refresh.unwrap_or(false),
        state.config.report_wait.deadline,
    )
    .await?;
    Ok(Json(access))
}

#[derive(sqlx::FromRow)]
struct ReportTargetRow {
    user_id: Option<Uuid>,
    anon_id: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    redacted_at: Option<DateTime<Utc>>,
}
