use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router, routing::get, routing::post};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use skala_core::attempt::{
    AttemptListItem, PaginatedResponse, RedactAttemptResponse, StartAttemptRequest,
    StartAttemptResponse, SubmitAttemptRequest, SubmitAttemptResponse,
};
use skala_core::error::ApiError;
use skala_core::token::{generate_resume_token, hash_token};

use crate::auth::{Caller, resume_token};
use crate::drafts;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::packs;
use crate::recorder::DomainEvent;
use crate::retake;
use crate::state::AppState;
use crate::submit;

pub fn start_router() -> Router<AppState> {
    Router::new().route("/v1/attempts", post(start_attempt))
}

pub fn submit_router() -> Router<AppState> {
    Router::new().route("/v1/attempts/{attempt_id}/submit", post(submit_attempt))
}

pub fn manage_router() -> Router<AppState> {
    Router::new()
        .route("/v1/attempts", get(list_attempts))
        .route("/v1/attempts/{attempt_id}/redact", post(redact_attempt))
}

/// Start a new attempt on a scale
///
/// Resolves the scale's current content pack, applies the retake policy,
/// and returns the resume token. The token is shown exactly once; the
/// server keeps only its hash.
#[utoipa::path(
    post,
    path = "/v1/attempts",
    request_body = StartAttemptRequest,
    responses(
        (status = 201, description = "Attempt started", body = StartAttemptResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Unknown or inactive scale", body = ApiError),
        (status = 429, description = "Retake policy denial", body = ApiError)
    ),
    tag = "attempts"
)]
pub async fn start_attempt(
    State(state): State<AppState>,
    caller: Caller,
    AppJson(request): AppJson<StartAttemptRequest>,
) -> Result<(StatusCode, Json<StartAttemptResponse>), AppError> {
    let identity = caller.require_owner()?;
    let code = packs::validate_scale_code(&request.scale_code)?;
    let scale = packs::load_active_scale(&state.db, code).await?;

    retake::enforce_retake_policy(
        &state.db,
        &state.config.retake,
        identity.org_id,
        &scale.code,
        identity,
    )
    .await?;

    let (token, token_hash) = generate_resume_token();
    let attempt_id = Uuid::now_v7();
    let expires_at = Utc::now() + state.config.draft_ttl();

    let mut tx = state.db.begin().await.map_err(AppError::Database)?;
    sqlx::query(
        r#"
        INSERT INTO attempts (id, org_id, scale_code, pack_id, pack_version,
                              user_id, anon_id, resume_token_hash,
                              device, channel, started_at, question_count)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), $11)
        "#,
    )
    .bind(attempt_id)
    .bind(identity.org_id)
    .bind(&scale.code)
    .bind(&scale.pack_id)
    .bind(&scale.pack_version)
    .bind(identity.user_id)
    .bind(&identity.anon_id)
    .bind(&token_hash)
    .bind(&request.device)
    .bind(&request.channel)
    .bind(scale.question_count)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    drafts::create_draft(&mut tx, attempt_id, &token_hash, expires_at)
        .await
        .map_err(AppError::Database)?;
    tx.commit().await.map_err(AppError::Database)?;

    tracing::info!(
        attempt_id = %attempt_id,
        scale_code = %scale.code,
        pack_version = %scale.pack_version,
        "attempt started"
    );

    Ok((
        StatusCode::CREATED,
        Json(StartAttemptResponse {
            attempt_id,
            resume_token: token,
            expires_at,
            question_count: scale.question_count,
        }),
    ))
}

/// Submit an attempt's final answers
///
/// Merges the request with the progress draft, scores the canonical answer
/// set, and commits exactly once. Resubmitting the same answers replays the
/// stored result; a different answer set is a conflict.
#[utoipa::path(
    post,
    path = "/v1/attempts/{attempt_id}/submit",
    params(("attempt_id" = Uuid, Path, description = "Attempt to submit")),
    request_body = SubmitAttemptRequest,
    responses(
        (status = 200, description = "Scored result, possibly replayed", body = SubmitAttemptResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Attempt unknown or not owned by the caller", body = ApiError),
        (status = 409, description = "Already submitted with different answers", body = ApiError),
        (status = 502, description = "Scoring engine failure", body = ApiError)
    ),
    tag = "attempts"
)]
pub async fn submit_attempt(
    State(state): State<AppState>,
    caller: Caller,
    Path(attempt_id): Path<Uuid>,
    AppJson(request): AppJson<SubmitAttemptRequest>,
) -> Result<Json<SubmitAttemptResponse>, AppError> {
    let identity = caller.require_owner()?;
    let response = submit::submit_attempt(&state, attempt_id, identity, request).await?;
    Ok(Json(response))
}

/// Redact an attempt
///
/// Blanks the stored answer and result payloads but keeps the rows for
/// audit. Requires the authenticated owner, or the attempt's resume token
/// for anonymous attempts. Idempotent.
#[utoipa::path(
    post,
    path = "/v1/attempts/{attempt_id}/redact",
    params(("attempt_id" = Uuid, Path, description = "Attempt to redact")),
    responses(
        (status = 200, description = "Attempt redacted", body = RedactAttemptResponse),
        (status = 404, description = "Attempt unknown or not owned by the caller", body = ApiError)
    ),
    tag = "attempts"
)]
pub async fn redact_attempt(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<RedactAttemptResponse>, AppError> {
    let org_id = caller.identity.org_id;
    let presented_hash = resume_token(&headers).map(|token| hash_token(&token));

    let mut tx = state.db.begin().await.map_err(AppError::Database)?;
    let row = sqlx::query_as::<_, RedactTargetRow>(
        r#"
        SELECT scale_code, user_id, resume_token_hash, redacted_at
        FROM attempts
        WHERE id = $1 AND org_id = $2
        FOR UPDATE
        "#,
    )
    .bind(attempt_id)
    .bind(org_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::attempt_not_found(attempt_id))?;

    // Redaction is destructive, so the bar is higher than plain ownership:
    // the authenticated owning user, or possession of the resume token.
    // An anon id alone does not qualify.
    let by_user = caller
        .identity
        .user_id
        .is_some_and(|caller_id| row.user_id == Some(caller_id));
    let by_token = presented_hash.as_deref() == Some(row.resume_token_hash.as_str());
    if !by_user && !by_token {
        return Err(AppError::attempt_not_found(attempt_id));
    }

    if let Some(redacted_at) = row.redacted_at {
        return Ok(Json(RedactAttemptResponse {
            attempt_id,
            redacted_at,
        }));
    }

    let redacted_at = Utc::now();
    sqlx::query("UPDATE attempts SET redacted_at = $2 WHERE id = $1")
        .bind(attempt_id)
        .bind(redacted_at)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;
    sqlx::query(
        "UPDATE attempt_answers SET payload = $2, payload_encoding = 'plain' WHERE attempt_id = $1",
    )
    .bind(attempt_id)
    .bind(Vec::<u8>::new())
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;
    sqlx::query("DELETE FROM attempt_answer_items WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;
    sqlx::query(
        r#"
        UPDATE attempt_results
        SET engine_output = '{}'::jsonb, type_code = NULL, score = NULL,
            percentile = NULL, updated_at = now()
        WHERE org_id = $2 AND attempt_id = $1
        "#,
    )
    .bind(attempt_id)
    .bind(org_id)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;
    sqlx::query(
        "UPDATE report_snapshots SET payload = NULL, updated_at = now() \
         WHERE org_id = $2 AND attempt_id = $1",
    )
    .bind(attempt_id)
    .bind(org_id)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;
    sqlx::query("DELETE FROM progress_drafts WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;
    tx.commit().await.map_err(AppError::Database)?;

    state.drafts.invalidate(attempt_id).await;
    state
        .events
        .record(DomainEvent {
            name: "attempt_redact",
            org_id,
            user_id: caller.identity.user_id,
            anon_id: caller.identity.anon_id.clone(),
            payload: serde_json::json!({ "scale_code": row.scale_code }),
        })
        .await;

    tracing::info!(attempt_id = %attempt_id, "attempt redacted");
    Ok(Json(RedactAttemptResponse {
        attempt_id,
        redacted_at,
    }))
}

#[derive(sqlx::FromRow)]
struct RedactTargetRow {
    scale_code: String,
    user_id: Option<Uuid>,
    resume_token_hash: String,
    redacted_at: Option<DateTime<Utc>>,
}

/// Query parameters for listing attempts
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListAttemptsParams {
    /// Maximum number of attempts to return (default 20, max 100)
    #[serde(default)]
    pub limit: Option<i64>,
    /// Cursor for pagination (opaque string from previous response's next_cursor)
    #[serde(default)]
    pub cursor: Option<String>,
}

/// List the caller's attempts
///
/// Newest first, cursor-paginated. Redacted attempts stay listed with
/// `redacted: true`; their payloads are gone.
#[utoipa::path(
    get,
    path = "/v1/attempts",
    params(ListAttemptsParams),
    responses(
        (status = 200, description = "Paginated attempt history", body = PaginatedResponse<AttemptListItem>),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "No identity presented", body = ApiError)
    ),
    tag = "attempts"
)]
pub async fn list_attempts(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ListAttemptsParams>,
) -> Result<Json<PaginatedResponse<AttemptListItem>>, AppError> {
    let identity = caller.require_owner()?;
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    // Fetch one extra to determine has_more
    let fetch_limit = limit + 1;

    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;

    let mut rows = if let Some(ref cursor) = cursor {
        sqlx::query_as::<_, AttemptHistoryRow>(
            r#"
            SELECT id, scale_code, pack_version, started_at, submitted_at, redacted_at, created_at
            FROM attempts
            WHERE org_id = $1
              AND (($2::uuid IS NOT NULL AND user_id = $2)
                OR ($3::text IS NOT NULL AND anon_id = $3))
              AND (created_at, id) < ($4, $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#,
        )
        .bind(identity.org_id)
        .bind(identity.user_id)
        .bind(&identity.anon_id)
        .bind(cursor.created_at)
        .bind(cursor.id)
        .bind(fetch_limit)
        .fetch_all(&state.db)
        .await
        .map_err(AppError::Database)?
    } else {
        sqlx::query_as::<_, AttemptHistoryRow>(
            r#"
            SELECT id, scale_code, pack_version, started_at, submitted_at, redacted_at, created_at
            FROM attempts
            WHERE org_id = $1
              AND (($2::uuid IS NOT NULL AND user_id = $2)
                OR ($3::text IS NOT NULL AND anon_id = $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(identity.org_id)
        .bind(identity.user_id)
        .bind(&identity.anon_id)
        .bind(fetch_limit)
        .fetch_all(&state.db)
        .await
        .map_err(AppError::Database)?
    };

    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);
    let next_cursor = if has_more {
        rows.last().map(|row| encode_cursor(&row.created_at, &row.id))
    } else {
        None
    };

    let data = rows
        .into_iter()
        .map(|row| AttemptListItem {
            attempt_id: row.id,
            scale_code: row.scale_code,
            pack_version: row.pack_version,
            started_at: row.started_at,
            submitted_at: row.submitted_at,
            redacted: row.redacted_at.is_some(),
        })
        .collect();

    Ok(Json(PaginatedResponse {
        data,
        next_cursor,
        has_more,
    }))
}

#[derive(sqlx::FromRow)]
struct AttemptHistoryRow {
    id: Uuid,
    scale_code: String,
    pack_version: String,
    started_at: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
    redacted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

struct HistoryCursor {
    created_at: DateTime<Utc>,
    id: Uuid,
}

/// Cursor is base64("created_at\0id") — opaque to the client, stable under
/// concurrent inserts.
fn encode_cursor(created_at: &DateTime<Utc>, id: &Uuid) -> String {
    use base64::Engine;
    let raw = format!("{}\0{}", created_at.to_rfc3339(), id);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

fn decode_cursor(cursor: &str) -> Result<HistoryCursor, AppError> {
    use base64::Engine;
    let invalid = |message: &str| AppError::Validation {
        message: message.to_string(),
        field: Some("cursor".to_string()),
        received: None,
        docs_hint: Some("Use the next_cursor value from a previous response.".to_string()),
    };

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid("Invalid cursor encoding"))?;
    let decoded = String::from_utf8(bytes).map_err(|_| invalid("Invalid cursor encoding"))?;

    let (raw_ts, raw_id) = decoded
        .split_once('\0')
        .ok_or_else(|| invalid("Invalid cursor structure"))?;
    let created_at = DateTime::parse_from_rfc3339(raw_ts)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid("Invalid cursor timestamp"))?;
    let id = Uuid::parse_str(raw_id).map_err(|_| invalid("Invalid cursor id"))?;

    Ok(HistoryCursor { created_at, id })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{decode_cursor, encode_cursor};

    #[test]
    fn cursor_survives_a_round_trip() {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let cursor = encode_cursor(&now, &id);
        let decoded = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded.id, id);
        assert_eq!(decoded.created_at.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn garbage_cursors_are_rejected() {
        assert!(decode_cursor("not-base64!").is_err());
        assert!(decode_cursor("bm8tc2VwYXJhdG9y").is_err());
    }
}
