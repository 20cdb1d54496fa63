use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use skala_core::token::hash_token;

use crate::entitlements::AttemptUnlock;
use crate::recorder::DomainEvent;
use crate::snapshots::SnapshotSeed;
use crate::state::AppState;
use crate::wallet::scale_credit_code;

pub const TEST_SUBMIT_EVENT: &str = "test_submit";

/// Everything the post-commit chain needs, captured before the submit
/// response is built.
#[derive(Debug, Clone)]
pub struct SubmitSideEffects {
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub scale_code: String,
    pub user_id: Option<Uuid>,
    pub anon_id: Option<String>,
    pub invite_token: Option<String>,
    pub idempotent_replay: bool,
}

/// Run the best-effort chain after a submission committed (or replayed).
///
/// Nothing here may fail the request: every step is caught and logged with
/// enough identifiers for reconciliation. The chain is at-least-once — a
/// replayed submission runs it again, and each step is idempotent at its
/// own boundary.
pub async fn run(state: &AppState, fx: SubmitSideEffects) {
    // 1. Attach the invitation, switching this attempt onto the B2B benefit.
    let invite_attached = match fx.invite_token.as_deref() {
        Some(token) => attach_invitation(&state.db, &fx, token).await,
        None => false,
    };

    let benefit_code = if invite_attached {
        state.config.b2b_benefit_code.clone()
    } else {
        scale_credit_code(&fx.scale_code)
    };

    // 2. Consume one credit. Disabled enforcement counts as "no credit
    // required", not as a failure.
    let credit_ok = if !state.config.credit_enforced {
        true
    } else {
        match state
            .wallet
            .consume(fx.org_id, &benefit_code, fx.attempt_id)
            .await
        {
            Ok(outcome) if outcome.granted() => true,
            Ok(_) => {
                tracing::warn!(
                    org_id = %fx.org_id,
                    attempt_id = %fx.attempt_id,
                    benefit_code = %benefit_code,
                    "credit consumption rejected; entitlement grant skipped"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    org_id = %fx.org_id,
                    attempt_id = %fx.attempt_id,
                    benefit_code = %benefit_code,
                    "credit consumption failed: {e}"
                );
                false
            }
        }
    };

    // 3. Grant report access, but never for an unpaid attempt.
    if credit_ok {
        let unlock = AttemptUnlock {
            org_id: fx.org_id,
            attempt_id: fx.attempt_id,
            user_id: fx.user_id,
            anon_id: fx.anon_id.clone(),
            source: "submit".to_string(),
        };
        if let Err(e) = state.entitlements.grant_attempt_unlock(unlock).await {
            tracing::warn!(
                org_id = %fx.org_id,
                attempt_id = %fx.attempt_id,
                "entitlement grant failed: {e}"
            );
        }
    }

    // 4. Seed the report snapshot and queue its render job.
    let seed = SnapshotSeed {
        org_id: fx.org_id,
        attempt_id: fx.attempt_id,
        trigger_source: "submit".to_string(),
        order_no: None,
    };
    if let Err(e) = state.snapshots.seed(seed).await {
        tracing::warn!(
            org_id = %fx.org_id,
            attempt_id = %fx.attempt_id,
            "report snapshot seeding failed: {e}"
        );
    }

    // 5. Analytics trail.
    state
        .events
        .record(DomainEvent {
            name: TEST_SUBMIT_EVENT,
            org_id: fx.org_id,
            user_id: fx.user_id,
            anon_id: fx.anon_id.clone(),
            payload: json!({
                "scale_code": fx.scale_code,
                "idempotent": fx.idempotent_replay,
            }),
        })
        .await;
}

/// Bind the invitation to this attempt. Reattaching the same attempt is a
/// no-op with the original `used_at`; a token already bound elsewhere,
/// expired, or unknown does not attach.
async fn attach_invitation(pool: &PgPool, fx: &SubmitSideEffects, token: &str) -> bool {
    let token_hash = hash_token(token);

    let attached = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE invitations
        SET attempt_id = $3, used_at = COALESCE(used_at, now())
        WHERE token_hash = $1 AND org_id = $2
          AND (attempt_id IS NULL OR attempt_id = $3)
          AND (scale_code IS NULL OR scale_code = $4)
          AND (expires_at IS NULL OR expires_at > now())
        RETURNING id
        "#,
    )
    .bind(&token_hash)
    .bind(fx.org_id)
    .bind(fx.attempt_id)
    .bind(&fx.scale_code)
    .fetch_optional(pool)
    .await;

    match attached {
        Ok(Some(invite_id)) => {
            let linked =
                sqlx::query("UPDATE attempts SET invite_id = $2 WHERE id = $1 AND invite_id IS NULL")
                    .bind(fx.attempt_id)
                    .bind(invite_id)
                    .execute(pool)
                    .await;
            if let Err(e) = linked {
                tracing::warn!(
                    org_id = %fx.org_id,
                    attempt_id = %fx.attempt_id,
                    invite_id = %invite_id,
                    "failed to link invitation on attempt: {e}"
                );
            }
            true
        }
        Ok(None) => {
            tracing::warn!(
                org_id = %fx.org_id,
                attempt_id = %fx.attempt_id,
                "invite token not attachable (unknown, already used, or expired)"
            );
            false
        }
        Err(e) => {
            tracing::warn!(
                org_id = %fx.org_id,
                attempt_id = %fx.attempt_id,
                "invitation lookup failed: {e}"
            );
            false
        }
    }
}
