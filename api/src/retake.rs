use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use skala_core::identity::Identity;

use crate::config::RetakePolicy;
use crate::error::AppError;

/// Round a wait up to whole seconds, never below one. A client told to
/// retry after 0s would hammer the endpoint inside the same second.
fn ceil_seconds(wait: Duration) -> i64 {
    let whole = wait.num_seconds();
    let rounded = if wait > Duration::seconds(whole) {
        whole + 1
    } else {
        whole
    };
    rounded.max(1)
}

/// How long until the cooldown clears, or `None` when a start is allowed.
fn cooldown_wait(
    cooldown_hours: i64,
    last_started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let clear_at = last_started + Duration::hours(cooldown_hours);
    (now < clear_at).then(|| clear_at - now)
}

/// How long until the oldest attempt leaves the rolling window, or `None`
/// when the window still has room.
fn window_wait(
    cap: i64,
    window_days: i64,
    attempts_in_window: i64,
    oldest_in_window: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if attempts_in_window < cap {
        return None;
    }
    let oldest = oldest_in_window?;
    let frees_at = oldest + Duration::days(window_days);
    Some((frees_at - now).max(Duration::seconds(0)))
}

#[derive(Debug, sqlx::FromRow)]
struct RetakeStats {
    window_count: i64,
    oldest_in_window: Option<DateTime<Utc>>,
    last_started: Option<DateTime<Utc>>,
}

/// Gate a new attempt on the org+scale+owner history. Redacted attempts do
/// not count. Denials carry the wait in seconds.
pub async fn enforce_retake_policy(
    pool: &PgPool,
    policy: &RetakePolicy,
    org_id: Uuid,
    scale_code: &str,
    identity: &Identity,
) -> Result<(), AppError> {
    if policy.cooldown_hours.is_none() && policy.window_cap.is_none() {
        return Ok(());
    }

    let now = Utc::now();
    let window_start = now - Duration::days(policy.window_days);

    let stats = sqlx::query_as::<_, RetakeStats>(
        r#"
        SELECT COUNT(*) FILTER (WHERE COALESCE(started_at, created_at) > $5) AS window_count,
               MIN(COALESCE(started_at, created_at))
                   FILTER (WHERE COALESCE(started_at, created_at) > $5) AS oldest_in_window,
               MAX(COALESCE(started_at, created_at)) AS last_started
        FROM attempts
        WHERE org_id = $1 AND scale_code = $2 AND redacted_at IS NULL
          AND (($3::uuid IS NOT NULL AND user_id = $3)
            OR ($4::text IS NOT NULL AND anon_id = $4))
        "#,
    )
    .bind(org_id)
    .bind(scale_code)
    .bind(identity.user_id)
    .bind(identity.anon_id.as_deref())
    .bind(window_start)
    .fetch_one(pool)
    .await
    .map_err(AppError::Database)?;

    if let (Some(cooldown_hours), Some(last_started)) =
        (policy.cooldown_hours, stats.last_started)
    {
        if let Some(wait) = cooldown_wait(cooldown_hours, last_started, now) {
            return Err(AppError::RateLimited {
                message: format!("Retake cooldown active for scale '{scale_code}'"),
                retry_after_seconds: Some(ceil_seconds(wait)),
            });
        }
    }

    if let Some(cap) = policy.window_cap {
        if let Some(wait) = window_wait(
            cap,
            policy.window_days,
            stats.window_count,
            stats.oldest_in_window,
            now,
        ) {
            return Err(AppError::RateLimited {
                message: format!(
                    "Retake limit of {cap} attempts per {} days reached for scale '{scale_code}'",
                    policy.window_days
                ),
                retry_after_seconds: Some(ceil_seconds(wait)),
            });
        }
    }

    Ok(())
}
