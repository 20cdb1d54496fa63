use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use skala_core::answers::{self, AnswerEntry};
use skala_core::identity::Identity;
use skala_core::progress::{ProgressSnapshot, SaveProgressRequest};
use skala_core::token::hash_token;

use crate::cache::CachedDraft;
use crate::error::AppError;
use crate::state::AppState;

/// How the caller proves it may touch a draft: the resume token issued at
/// start, or the identity that owns the attempt.
pub enum DraftAccess<'a> {
    ResumeToken(&'a str),
    Owner(&'a Identity),
}

#[derive(Debug, sqlx::FromRow)]
struct DraftRow {
    token_hash: String,
    last_seq: i64,
    cursor: Option<String>,
    duration_ms: Option<i64>,
    answers: serde_json::Value,
    expires_at: DateTime<Utc>,
    owner_user_id: Option<Uuid>,
    owner_anon_id: Option<String>,
    redacted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
enum SeqDecision {
    Apply,
    Replay,
    Stale { last_seq: i64 },
}

fn decide_seq(last_seq: i64, incoming: i64) -> SeqDecision {
    if incoming < last_seq {
        SeqDecision::Stale { last_seq }
    } else if incoming == last_seq {
        SeqDecision::Replay
    } else {
        SeqDecision::Apply
    }
}

fn authorize(access: &DraftAccess<'_>, row: &DraftRow, attempt_id: Uuid) -> Result<(), AppError> {
    let allowed = match access {
        DraftAccess::ResumeToken(token) => hash_token(token) == row.token_hash,
        DraftAccess::Owner(identity) => {
            identity.owns(row.owner_user_id, row.owner_anon_id.as_deref())
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(AppError::attempt_not_found(attempt_id))
    }
}

// ──────────────────────────────────────────────
// JSONB map <-> entry list
// ──────────────────────────────────────────────

fn entries_from_map(stored: &serde_json::Value) -> Result<Vec<AnswerEntry>, AppError> {
    let Some(map) = stored.as_object() else {
        tracing::error!("progress draft answers column is not a JSON object");
        return Err(AppError::Internal(
            "stored draft answers are malformed".to_string(),
        ));
    };
    map.values()
        .map(|value| {
            serde_json::from_value::<AnswerEntry>(value.clone()).map_err(|e| {
                tracing::error!("progress draft answer entry failed to decode: {e}");
                AppError::Internal("stored draft answers are malformed".to_string())
            })
        })
        .collect()
}

fn map_from_entries(entries: &[AnswerEntry]) -> Result<serde_json::Value, AppError> {
    let mut map = serde_json::Map::with_capacity(entries.len());
    for entry in entries {
        let value = serde_json::to_value(entry)
            .map_err(|e| AppError::Internal(format!("draft answer failed to encode: {e}")))?;
        map.insert(entry.question_id.clone(), value);
    }
    Ok(serde_json::Value::Object(map))
}

// ──────────────────────────────────────────────
// Store operations
// ──────────────────────────────────────────────

/// Insert the draft row for a freshly started attempt. Runs inside the
/// start transaction.
pub async fn create_draft(
    tx: &mut Transaction<'_, Postgres>,
    attempt_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO progress_drafts (attempt_id, token_hash, expires_at)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(attempt_id)
    .bind(token_hash)
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete the draft once its attempt is submitted. Runs inside the submit
/// transaction; the caller invalidates the cache after commit.
pub async fn clear_draft(
    tx: &mut Transaction<'_, Postgres>,
    attempt_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM progress_drafts WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Read the draft's merged answers and elapsed time for the submit merge.
/// Lock-free: a progress write racing the submit either lands before this
/// read and is merged, or after, in which case the draft is about to be
/// deleted anyway.
pub async fn draft_state_for_submit(
    pool: &PgPool,
    attempt_id: Uuid,
) -> Result<(Vec<AnswerEntry>, Option<i64>), AppError> {
    let row = sqlx::query_as::<_, (serde_json::Value, Option<i64>)>(
        "SELECT answers, duration_ms FROM progress_drafts WHERE attempt_id = $1",
    )
    .bind(attempt_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?;

    match row {
        Some((stored, duration_ms)) => Ok((entries_from_map(&stored)?, duration_ms)),
        None => Ok((vec![], None)),
    }
}

/// Apply one progress write. Token-or-owner guarded, seq-gated, merge is
/// per question with the incoming entry winning. The draft's expiry is
/// fixed at start and never extended here.
pub async fn save_progress(
    state: &AppState,
    attempt_id: Uuid,
    access: DraftAccess<'_>,
    request: SaveProgressRequest,
) -> Result<ProgressSnapshot, AppError> {
    if request.seq < 1 {
        return Err(AppError::Validation {
            message: "seq must be a positive integer".to_string(),
            field: Some("seq".to_string()),
            received: Some(serde_json::Value::from(request.seq)),
            docs_hint: Some("Start at 1 and increase by 1 for every save.".to_string()),
        });
    }
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

    let mut tx = state.db.begin().await.map_err(AppError::Database)?;

    let row = sqlx::query_as::<_, DraftRow>(
        r#"
        SELECT d.token_hash, d.last_seq, d.cursor, d.duration_ms, d.answers, d.expires_at,
               a.user_id AS owner_user_id, a.anon_id AS owner_anon_id, a.redacted_at
        FROM progress_drafts d
        JOIN attempts a ON a.id = d.attempt_id
        WHERE d.attempt_id = $1
        FOR UPDATE OF d
        "#,
    )
    .bind(attempt_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    let Some(row) = row else {
        return Err(missing_draft_error(&state.db, attempt_id, &access).await);
    };

    authorize(&access, &row, attempt_id)?;
    if row.redacted_at.is_some() {
        return Err(AppError::attempt_not_found(attempt_id));
    }
    if row.expires_at <= Utc::now() {
        return Err(AppError::Expired {
            resource: "progress draft".to_string(),
        });
    }

    match decide_seq(row.last_seq, request.seq) {
        SeqDecision::Stale { last_seq } => return Err(AppError::StaleProgress { last_seq }),
        SeqDecision::Replay => {
            // Duplicate delivery of the write we already applied: answer with
            // the current state and change nothing.
            let merged = answers::canonicalize(entries_from_map(&row.answers)?);
            let snapshot = build_snapshot(attempt_id, &row, merged, row.cursor.clone());
            cache_snapshot(state, &row, snapshot.clone()).await;
            return Ok(snapshot);
        }
        SeqDecision::Apply => {}
    }

    let existing = entries_from_map(&row.answers)?;
    let merged = answers::canonicalize(existing.into_iter().chain(request.answers));
    let answers_map = map_from_entries(&merged)?;
    let answered_count = merged.len() as i32;
    let cursor = request.cursor.or_else(|| row.cursor.clone());
    let duration_ms = request.duration_ms.or(row.duration_ms);

    sqlx::query(
        r#"
        UPDATE progress_drafts
        SET last_seq = $2, cursor = $3, duration_ms = $4, answers = $5,
            answered_count = $6, updated_at = now()
        WHERE attempt_id = $1
        "#,
    )
    .bind(attempt_id)
    .bind(request.seq)
    .bind(&cursor)
    .bind(duration_ms)
    .bind(&answers_map)
    .bind(answered_count)
    .execute(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    tx.commit().await.map_err(AppError::Database)?;

    let snapshot = ProgressSnapshot {
        attempt_id,
        last_seq: request.seq,
        cursor,
        duration_ms,
        answered_count,
        answers: merged,
        expires_at: row.expires_at,
    };
    cache_snapshot(state, &row, snapshot.clone()).await;
    Ok(snapshot)
}

/// Read the current draft, serving from the in-process cache when possible.
pub async fn get_progress(
    state: &AppState,
    attempt_id: Uuid,
    access: DraftAccess<'_>,
) -> Result<ProgressSnapshot, AppError> {
    if let Some(cached) = state.drafts.get(attempt_id).await {
        let allowed = match &access {
            DraftAccess::ResumeToken(token) => hash_token(token) == cached.token_hash,
            DraftAccess::Owner(identity) => {
                identity.owns(cached.owner_user_id, cached.owner_anon_id.as_deref())
            }
        };
        if !allowed {
            return Err(AppError::attempt_not_found(attempt_id));
        }
        return Ok(cached.snapshot);
    }

    let row = sqlx::query_as::<_, DraftRow>(
        r#"
        SELECT d.token_hash, d.last_seq, d.cursor, d.duration_ms, d.answers, d.expires_at,
               a.user_id AS owner_user_id, a.anon_id AS owner_anon_id, a.redacted_at
        FROM progress_drafts d
        JOIN attempts a ON a.id = d.attempt_id
        WHERE d.attempt_id = $1
        "#,
    )
    .bind(attempt_id)
    .fetch_optional(&state.db)
    .await
    .map_err(AppError::Database)?;

    let Some(row) = row else {
        return Err(missing_draft_error(&state.db, attempt_id, &access).await);
    };

    authorize(&access, &row, attempt_id)?;
    if row.redacted_at.is_some() {
        return Err(AppError::attempt_not_found(attempt_id));
    }
    if row.expires_at <= Utc::now() {
        return Err(AppError::Expired {
            resource: "progress draft".to_string(),
        });
    }

    let merged = answers::canonicalize(entries_from_map(&row.answers)?);
    let snapshot = build_snapshot(attempt_id, &row, merged, row.cursor.clone());
    cache_snapshot(state, &row, snapshot.clone()).await;
    Ok(snapshot)
}

fn build_snapshot(
    attempt_id: Uuid,
    row: &DraftRow,
    answers: Vec<AnswerEntry>,
    cursor: Option<String>,
) -> ProgressSnapshot {
    ProgressSnapshot {
        attempt_id,
        last_seq: row.last_seq,
        cursor,
        duration_ms: row.duration_ms,
        answered_count: answers.len() as i32,
        answers,
        expires_at: row.expires_at,
    }
}

async fn cache_snapshot(state: &AppState, row: &DraftRow, snapshot: ProgressSnapshot) {
    state
        .drafts
        .put(CachedDraft {
            token_hash: row.token_hash.clone(),
            owner_user_id: row.owner_user_id,
            owner_anon_id: row.owner_anon_id.clone(),
            snapshot,
        })
        .await;
}

/// The draft is gone. For an owner we can still say why: a submitted attempt
/// keeps its row in `attempts`, so a late progress write gets a conflict
/// instead of a bare not-found. Token holders learn nothing.
async fn missing_draft_error(
    pool: &PgPool,
    attempt_id: Uuid,
    access: &DraftAccess<'_>,
) -> AppError {
    let DraftAccess::Owner(identity) = access else {
        return AppError::attempt_not_found(attempt_id);
    };

    let attempt = sqlx::query_as::<_, (Option<Uuid>, Option<String>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
        "SELECT user_id, anon_id, submitted_at, redacted_at FROM attempts WHERE id = $1 AND org_id = $2",
    )
    .bind(attempt_id)
    .bind(identity.org_id)
    .fetch_optional(pool)
    .await;

    match attempt {
        Ok(Some((owner_user_id, owner_anon_id, submitted_at, redacted_at)))
            if identity.owns(owner_user_id, owner_anon_id.as_deref())
                && redacted_at.is_none()
                && submitted_at.is_some() =>
        {
            AppError::Conflict {
                message: "Attempt already submitted; progress is closed".to_string(),
            }
        }
        Ok(_) => AppError::attempt_not_found(attempt_id),
        Err(e) => AppError::Database(e),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    use skala_core::answers::AnswerEntry;
    use skala_core::identity::Identity;
    use skala_core::progress::SaveProgressRequest;
    use skala_core::token::generate_resume_token;

    use crate::error::AppError;
    use crate::testing::{StateOverrides, test_state_on};

    use super::{
        DraftAccess, DraftRow, SeqDecision, authorize, decide_seq, entries_from_map,
        map_from_entries, save_progress,
    };

    fn entry(id: &str, answer: serde_json::Value) -> AnswerEntry {
        AnswerEntry {
            question_id: id.to_string(),
            question_index: None,
            question_type: None,
            code: None,
            answer,
        }
    }

    fn draft_row(
        token_hash: &str,
        owner_user_id: Option<Uuid>,
        owner_anon_id: Option<&str>,
    ) -> DraftRow {
        DraftRow {
            token_hash: token_hash.to_string(),
            last_seq: 3,
            cursor: None,
            duration_ms: None,
            answers: json!({}),
            expires_at: Utc::now() + chrono::Duration::days(7),
            owner_user_id,
            owner_anon_id: owner_anon_id.map(ToString::to_string),
            redacted_at: None,
        }
    }

    #[test]
    fn seq_gate_orders_writes() {
        assert_eq!(decide_seq(3, 4), SeqDecision::Apply);
        assert_eq!(decide_seq(3, 3), SeqDecision::Replay);
        assert_eq!(decide_seq(3, 2), SeqDecision::Stale { last_seq: 3 });
        assert_eq!(decide_seq(0, 1), SeqDecision::Apply);
    }

    #[test]
    fn draft_access_requires_matching_token() {
        let (token, token_hash) = generate_resume_token();
        let (other_token, _) = generate_resume_token();
        let row = draft_row(&token_hash, None, Some("device-1"));
        let attempt_id = Uuid::now_v7();

        assert!(authorize(&DraftAccess::ResumeToken(&token), &row, attempt_id).is_ok());

        // A wrong token reads exactly like a missing attempt.
        let err = authorize(&DraftAccess::ResumeToken(&other_token), &row, attempt_id)
            .expect_err("mismatched token must be rejected");
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[test]
    fn draft_access_requires_owning_identity() {
        let org_id = Uuid::now_v7();
        let owner = Uuid::now_v7();
        let (_, token_hash) = generate_resume_token();
        let row = draft_row(&token_hash, Some(owner), None);
        let attempt_id = Uuid::now_v7();

        let owning = Identity::authenticated(owner, org_id);
        assert!(authorize(&DraftAccess::Owner(&owning), &row, attempt_id).is_ok());

        let stranger = Identity::authenticated(Uuid::now_v7(), org_id);
        let err = authorize(&DraftAccess::Owner(&stranger), &row, attempt_id)
            .expect_err("non-owner must be rejected");
        assert!(matches!(err, AppError::NotFound { .. }));

        // An anonymous caller cannot claim a user-owned draft either.
        let anon = Identity::anonymous("some-device", org_id);
        assert!(authorize(&DraftAccess::Owner(&anon), &row, attempt_id).is_err());
    }

    #[test]
    fn stored_map_roundtrips_to_entries() {
        let entries = vec![entry("q1", json!(4)), entry("q2", json!("yes"))];
        let map = map_from_entries(&entries).unwrap();
        assert!(map.get("q1").is_some());

        let mut back = entries_from_map(&map).unwrap();
        back.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].question_id, "q1");
        assert_eq!(back[0].answer, json!(4));
    }

    #[test]
    fn non_object_stored_answers_fail_loudly() {
        assert!(entries_from_map(&json!([1, 2, 3])).is_err());
        assert!(entries_from_map(&json!(null)).is_err());
    }

    // Runs only when DATABASE_URL points at a Postgres instance; without one
    // it passes vacuously.

    async fn db_pool_if_available() -> Option<sqlx::PgPool> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return None;
        };

        PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .ok()
    }

    #[tokio::test]
    async fn stale_seq_leaves_the_stored_draft_untouched() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let (state, _probes) = test_state_on(pool.clone(), StateOverrides::default());
        let org_id = state.config.default_org_id;

        let scale_code = format!("scale_{}", Uuid::now_v7().simple());
        sqlx::query(
            "INSERT INTO scales (code, title, pack_id, pack_version, question_count) \
             VALUES ($1, 'Test Scale', 'pack', '2.1.0', 3)",
        )
        .bind(&scale_code)
        .execute(&pool)
        .await
        .expect("insert scale");

        let attempt_id = Uuid::now_v7();
        let (token, token_hash) = generate_resume_token();
        let anon_id = format!("device-{}", Uuid::now_v7().simple());
        sqlx::query(
            "INSERT INTO attempts (id, org_id, scale_code, pack_id, pack_version, \
             anon_id, resume_token_hash, question_count, started_at) \
             VALUES ($1, $2, $3, 'pack', '2.1.0', $4, $5, 3, now())",
        )
        .bind(attempt_id)
        .bind(org_id)
        .bind(&scale_code)
        .bind(&anon_id)
        .bind(&token_hash)
        .execute(&pool)
        .await
        .expect("insert attempt");

        let stored_answers = json!({ "q1": { "question_id": "q1", "answer": 4 } });
        sqlx::query(
            "INSERT INTO progress_drafts (attempt_id, token_hash, last_seq, answers, \
             answered_count, expires_at) \
             VALUES ($1, $2, 5, $3, 1, now() + interval '7 days')",
        )
        .bind(attempt_id)
        .bind(&token_hash)
        .bind(&stored_answers)
        .execute(&pool)
        .await
        .expect("insert draft");

        let before: chrono::DateTime<Utc> =
            sqlx::query_scalar("SELECT updated_at FROM progress_drafts WHERE attempt_id = $1")
                .bind(attempt_id)
                .fetch_one(&pool)
                .await
                .expect("read updated_at");

        let err = save_progress(
            &state,
            attempt_id,
            DraftAccess::ResumeToken(&token),
            SaveProgressRequest {
                seq: 4,
                cursor: Some("p9".to_string()),
                duration_ms: Some(120_000),
                answers: vec![entry("q9", json!(1))],
            },
        )
        .await
        .expect_err("stale seq must be rejected");
        assert!(matches!(err, AppError::StaleProgress { last_seq: 5 }));

        let (last_seq, answers, answered_count, cursor, updated_at): (
            i64,
            serde_json::Value,
            i32,
            Option<String>,
            chrono::DateTime<Utc>,
        ) = sqlx::query_as(
            "SELECT last_seq, answers, answered_count, cursor, updated_at \
             FROM progress_drafts WHERE attempt_id = $1",
        )
        .bind(attempt_id)
        .fetch_one(&pool)
        .await
        .expect("re-read draft");
        assert_eq!(last_seq, 5);
        assert_eq!(answers, stored_answers);
        assert_eq!(answered_count, 1);
        assert_eq!(cursor, None);
        assert_eq!(updated_at, before);
    }
}
