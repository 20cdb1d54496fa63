use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::{Json, Router, routing::get, routing::put};
use uuid::Uuid;

use skala_core::error::ApiError;
use skala_core::progress::{ProgressSnapshot, SaveProgressRequest};

use crate::auth::{Caller, resume_token};
use crate::drafts::{self, DraftAccess};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn write_router() -> Router<AppState> {
    Router::new().route("/v1/attempts/{attempt_id}/progress", put(save_progress))
}

pub fn read_router() -> Router<AppState> {
    Router::new().route("/v1/attempts/{attempt_id}/progress", get(get_progress))
}

/// Save progress on an in-flight attempt
///
/// Guarded by the resume token (`X-Resume-Token`) or the owning identity.
/// `seq` orders writes: replays of the applied seq return the current
/// state, anything older is rejected with the server's `last_seq`.
#[utoipa::path(
    put,
    path = "/v1/attempts/{attempt_id}/progress",
    params(
        ("attempt_id" = Uuid, Path, description = "Attempt the draft belongs to"),
        ("x-resume-token" = Option<String>, Header, description = "Resume token from the start response")
    ),
    request_body = SaveProgressRequest,
    responses(
        (status = 200, description = "Merged draft state", body = ProgressSnapshot),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Draft unknown or not accessible", body = ApiError),
        (status = 409, description = "Stale sequence number, or attempt already submitted", body = ApiError),
        (status = 410, description = "Draft expired", body = ApiError)
    ),
    tag = "progress"
)]
pub async fn save_progress(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Path(attempt_id): Path<Uuid>,
    AppJson(request): AppJson<SaveProgressRequest>,
) -> Result<Json<ProgressSnapshot>, AppError> {
    let token = resume_token(&headers);
    let access = match token.as_deref() {
        Some(token) => DraftAccess::ResumeToken(token),
        None => DraftAccess::Owner(caller.require_owner()?),
    };
    let snapshot = drafts::save_progress(&state, attempt_id, access, request).await?;
    Ok(Json(snapshot))
}

/// Read the current progress draft
///
/// Same access rules as the write; served from the in-process draft cache
/// when the attempt was touched recently.
#[utoipa::path(
    get,
    path = "/v1/attempts/{attempt_id}/progress",
    params(
        ("attempt_id" = Uuid, Path, description = "Attempt the draft belongs to"),
        ("x-resume-token" = Option<String>, Header, description = "Resume token from the start response")
    ),
    responses(
        (status = 200, description = "Current draft state", body = ProgressSnapshot),
        (status = 404, description = "Draft unknown or not accessible", body = ApiError),
        (status = 409, description = "Attempt already submitted", body = ApiError),
        (status = 410, description = "Draft expired", body = ApiError)
    ),
    tag = "progress"
)]
pub async fn get_progress(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<ProgressSnapshot>, AppError> {
    let token = resume_token(&headers);
    let access = match token.as_deref() {
        Some(token) => DraftAccess::ResumeToken(token),
        None => DraftAccess::Owner(caller.require_owner()?),
    };
    let snapshot = drafts::get_progress(&state, attempt_id, access).await?;
    Ok(Json(snapshot))
}
