use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use skala_core::answers::{self, AnswerEntry};
use skala_core::attempt::{SubmitAttemptRequest, SubmitAttemptResponse};
use skala_core::identity::Identity;

use crate::drafts;
use crate::error::AppError;
use crate::report_gate;
use crate::scoring::{ScoreOutcome, ScoreRequest};
use crate::sideeffects::{self, SubmitSideEffects};
use crate::state::AppState;

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    org_id: Uuid,
    scale_code: String,
    pack_version: String,
    user_id: Option<Uuid>,
    anon_id: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    answers_digest: Option<String>,
    redacted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    engine_output: serde_json::Value,
    type_code: Option<String>,
    pack_version: String,
    scoring_spec_version: String,
}

/// Finalize an attempt: merge the request with the live draft, canonicalize
/// and hash, score outside any lock, then commit under a row lock. Duplicate
/// submissions replay the stored result; divergent ones conflict.
pub async fn submit_attempt(
    state: &AppState,
    attempt_id: Uuid,
    identity: &Identity,
    request: SubmitAttemptRequest,
) -> Result<SubmitAttemptResponse, AppError> {
    validate_request(&request)?;

    let attempt = load_attempt(&state.db, attempt_id, identity).await?;

    // A committed duplicate is decided by digest alone — no draft (it was
    // deleted on first commit), no scoring call.
    if attempt.submitted_at.is_some() {
        let candidate = answers::canonicalize(request.answers);
        let digest = compute_digest(&attempt, &candidate)?;
        return finish_replay(
            state,
            attempt_id,
            &attempt,
            attempt.answers_digest.as_deref(),
            &digest,
            request.invite_token,
        )
        .await;
    }

    let (draft_answers, draft_duration) =
        drafts::draft_state_for_submit(&state.db, attempt_id).await?;
    let merged = answers::merge_answers(request.answers, draft_answers);
    if merged.is_empty() {
        return Err(AppError::Validation {
            message: "answers must contain at least one entry".to_string(),
            field: Some("answers".to_string()),
            received: None,
            docs_hint: Some("Include the final answer list in the submit body.".to_string()),
        });
    }
    let duration_ms = request.duration_ms.or(draft_duration);
    let digest = compute_digest(&attempt, &merged)?;

    // Scoring runs before the critical section: expensive, external, and
    // treated as a pure function of the canonical answers.
    let outcome = state
        .scoring
        .score(ScoreRequest {
            scale_code: attempt.scale_code.clone(),
            pack_version: attempt.pack_version.clone(),
            answers: merged.clone(),
            duration_ms,
        })
        .await
        .map_err(|e| AppError::Upstream {
            message: e.to_string(),
        })?;

    match persist_submission(state, attempt_id, &attempt, &merged, &digest, duration_ms, &outcome)
        .await?
    {
        Persisted::Committed => {
            state.drafts.invalidate(attempt_id).await;
            sideeffects::run(
                state,
                side_effects(&attempt, attempt_id, request.invite_token, false),
            )
            .await;
            let report = report_gate::embed(state, attempt.org_id, attempt_id).await;
            Ok(SubmitAttemptResponse {
                attempt_id,
                type_code: outcome.type_code,
                scores: outcome.result,
                pack_version: outcome.pack_version,
                scoring_spec_version: outcome.scoring_spec_version,
                idempotent: false,
                report,
            })
        }
        // Another submit won the race after we scored: fall back to the
        // digest decision against what that submit stored.
        Persisted::AlreadySubmitted { stored_digest } => {
            finish_replay(
                state,
                attempt_id,
                &attempt,
                stored_digest.as_deref(),
                &digest,
                request.invite_token,
            )
            .await
        }
    }
}

fn validate_request(request: &SubmitAttemptRequest) -> Result<(), AppError> {
    if let Some(duration_ms) = request.duration_ms {
        if duration_ms < 0 {
            return Err(AppError::Validation {
                message: "duration_ms must be >= 0".to_string(),
                field: Some("duration_ms".to_string()),
                received: Some(serde_json::Value::from(duration_ms)),
                docs_hint: None,
            });
        }
    }
    if let Some(token) = request.invite_token.as_deref() {
        if !token.starts_with("skala_inv_") {
            return Err(AppError::Validation {
                message: "invite_token is not a valid invitation token".to_string(),
                field: Some("invite_token".to_string()),
                received: None,
                docs_hint: Some("Invitation tokens start with 'skala_inv_'.".to_string()),
            });
        }
    }
    Ok(())
}

fn compute_digest(attempt: &AttemptRow, entries: &[AnswerEntry]) -> Result<String, AppError> {
    answers::answers_digest(&attempt.scale_code, &attempt.pack_version, entries)
        .map_err(|e| AppError::Internal(format!("canonical encoding failed: {e}")))
}

fn side_effects(
    attempt: &AttemptRow,
    attempt_id: Uuid,
    invite_token: Option<String>,
    idempotent_replay: bool,
) -> SubmitSideEffects {
    SubmitSideEffects {
        org_id: attempt.org_id,
        attempt_id,
        scale_code: attempt.scale_code.clone(),
        user_id: attempt.user_id,
        anon_id: attempt.anon_id.clone(),
        invite_token,
        idempotent_replay,
    }
}

async fn load_attempt(
    pool: &PgPool,
    attempt_id: Uuid,
    identity: &Identity,
) -> Result<AttemptRow, AppError> {
    let row = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT org_id, scale_code, pack_version, user_id, anon_id,
               submitted_at, answers_digest, redacted_at
        FROM attempts
        WHERE id = $1 AND org_id = $2
        "#,
    )
    .bind(attempt_id)
    .bind(identity.org_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::attempt_not_found(attempt_id))?;

    if !identity.owns(row.user_id, row.anon_id.as_deref()) || row.redacted_at.is_some() {
        return Err(AppError::attempt_not_found(attempt_id));
    }
    Ok(row)
}

enum Persisted {
    Committed,
    AlreadySubmitted { stored_digest: Option<String> },
}

/// The critical section: lock the attempt row, re-check the submitted flag,
/// and either persist everything or report who got there first.
async fn persist_submission(
    state: &AppState,
    attempt_id: Uuid,
    attempt: &AttemptRow,
    merged: &[AnswerEntry],
    digest: &str,
    duration_ms: Option<i64>,
    outcome: &ScoreOutcome,
) -> Result<Persisted, AppError> {
    let mut tx = state.db.begin().await.map_err(AppError::Database)?;

    let locked = sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<String>, Option<DateTime<Utc>>)>(
        "SELECT submitted_at, answers_digest, redacted_at FROM attempts WHERE id = $1 FOR UPDATE",
    )
    .bind(attempt_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::attempt_not_found(attempt_id))?;

    // A redaction that landed between the pre-read and this lock wins.
    if locked.2.is_some() {
        return Err(AppError::attempt_not_found(attempt_id));
    }
    if locked.0.is_some() {
        return Ok(Persisted::AlreadySubmitted {
            stored_digest: locked.1,
        });
    }

    let canonical = answers::canonical_json(merged)
        .map_err(|e| AppError::Internal(format!("canonical encoding failed: {e}")))?;
    let (payload, encoding) = answers::encode_payload(&canonical);
    let question_count = merged.len() as i32;

    sqlx::query(
        r#"
        INSERT INTO attempt_answers (attempt_id, org_id, payload, payload_encoding,
                                     answers_digest, question_count)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(attempt_id)
    .bind(attempt.org_id)
    .bind(&payload)
    .bind(encoding.as_str())
    .bind(digest)
    .bind(question_count)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    // Per-question fan-out for analytics; not part of any read path.
    for entry in merged {
        sqlx::query(
            r#"
            INSERT INTO attempt_answer_items (attempt_id, question_id, question_index,
                                              question_type, code, answer)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt_id)
        .bind(&entry.question_id)
        .bind(entry.question_index)
        .bind(&entry.question_type)
        .bind(&entry.code)
        .bind(&entry.answer)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;
    }

    sqlx::query(
        r#"
        UPDATE attempts
        SET submitted_at = now(),
            started_at = COALESCE(started_at, now()),
            duration_ms = $2,
            answers_digest = $3,
            scoring_spec_version = $4
        WHERE id = $1
        "#,
    )
    .bind(attempt_id)
    .bind(duration_ms)
    .bind(digest)
    .bind(&outcome.scoring_spec_version)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    sqlx::query(
        r#"
        INSERT INTO attempt_results (org_id, attempt_id, scale_code, engine_output,
                                     type_code, score, percentile, pack_version,
                                     scoring_spec_version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (org_id, attempt_id) DO UPDATE
        SET engine_output = EXCLUDED.engine_output,
            type_code = EXCLUDED.type_code,
            score = EXCLUDED.score,
            percentile = EXCLUDED.percentile,
            pack_version = EXCLUDED.pack_version,
            scoring_spec_version = EXCLUDED.scoring_spec_version,
            updated_at = now()
        "#,
    )
    .bind(attempt.org_id)
    .bind(attempt_id)
    .bind(&attempt.scale_code)
    .bind(&outcome.result)
    .bind(&outcome.type_code)
    .bind(outcome.score)
    .bind(outcome.percentile)
    .bind(&outcome.pack_version)
    .bind(&outcome.scoring_spec_version)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    drafts::clear_draft(&mut tx, attempt_id)
        .await
        .map_err(AppError::Database)?;

    tx.commit().await.map_err(AppError::Database)?;
    Ok(Persisted::Committed)
}

/// Answer a duplicate submission: equal digest replays the stored result,
/// anything else is a hard conflict. The side-effect chain runs again — it
/// is idempotent throughout, and re-running it heals a submit that
/// committed but crashed before its side effects.
async fn finish_replay(
    state: &AppState,
    attempt_id: Uuid,
    attempt: &AttemptRow,
    stored_digest: Option<&str>,
    candidate_digest: &str,
    invite_token: Option<String>,
) -> Result<SubmitAttemptResponse, AppError> {
    let Some(stored) = stored_digest else {
        tracing::error!(
            attempt_id = %attempt_id,
            "submitted attempt has no stored digest"
        );
        return Err(AppError::Internal(
            "submitted attempt is missing its answer digest".to_string(),
        ));
    };

    if stored != candidate_digest {
        return Err(AppError::Conflict {
            message: "Attempt was already submitted with a different answer set".to_string(),
        });
    }

    let result = sqlx::query_as::<_, ResultRow>(
        r#"
        SELECT engine_output, type_code, pack_version, scoring_spec_version
        FROM attempt_results
        WHERE org_id = $1 AND attempt_id = $2
        "#,
    )
    .bind(attempt.org_id)
    .bind(attempt_id)
    .fetch_optional(&state.db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| {
        tracing::error!(
            attempt_id = %attempt_id,
            "submitted attempt has no result row"
        );
        AppError::Internal("submitted attempt is missing its result".to_string())
    })?;

    state.drafts.invalidate(attempt_id).await;
    sideeffects::run(state, side_effects(attempt, attempt_id, invite_token, true)).await;
    let report = report_gate::embed(state, attempt.org_id, attempt_id).await;

    Ok(SubmitAttemptResponse {
        attempt_id,
        type_code: result.type_code,
        scores: result.engine_output,
        pack_version: result.pack_version,
        scoring_spec_version: result.scoring_spec_version,
        idempotent: true,
        report,
    })
}
