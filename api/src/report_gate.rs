use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use skala_core::report::ReportAccess;

use crate::error::AppError;
use crate::snapshots::{SnapshotSeed, SnapshotStatus};
use crate::state::AppState;

/// Resolve report access for an attempt the caller is already known to own.
///
/// Entitlement is checked before anything else — an unentitled caller gets a
/// `locked` stub and never learns whether a report exists. Entitled callers
/// poll the snapshot row up to `deadline`; a render that outlives the
/// deadline degrades to an explicit `processing` answer with a poll hint.
/// No database lock is held at any point.
pub async fn resolve(
    state: &AppState,
    org_id: Uuid,
    attempt_id: Uuid,
    refresh: bool,
    deadline: Duration,
) -> Result<ReportAccess, AppError> {
    let entitled = if state.config.credit_enforced {
        state
            .entitlements
            .has_full_access(org_id, attempt_id)
            .await
            .map_err(|e| AppError::Internal(format!("entitlement lookup failed: {e}")))?
    } else {
        true
    };
    if !entitled {
        return Ok(ReportAccess::locked());
    }

    let poll = state.config.report_wait.poll_interval;
    let poll_ms = poll.as_millis() as u64;

    if refresh {
        let seed = render_seed(org_id, attempt_id, "refresh");
        state
            .snapshots
            .reset_to_queued(seed)
            .await
            .map_err(|e| AppError::Internal(format!("report refresh failed: {e}")))?;
    }

    let deadline_at = Instant::now() + deadline;
    loop {
        let snapshot = state
            .snapshots
            .fetch(org_id, attempt_id)
            .await
            .map_err(|e| AppError::Internal(format!("report snapshot lookup failed: {e}")))?;

        match snapshot {
            None => {
                // Entitled but never seeded (crash before side effects, or a
                // legacy attempt). Seed now and fall into the wait below.
                let seed = render_seed(org_id, attempt_id, "report_request");
                state
                    .snapshots
                    .seed(seed)
                    .await
                    .map_err(|e| AppError::Internal(format!("report seeding failed: {e}")))?;
            }
            Some(record) => match record.status {
                SnapshotStatus::Success => {
                    let Some(payload) = record.payload else {
                        tracing::error!(
                            org_id = %org_id,
                            attempt_id = %attempt_id,
                            "report snapshot marked success without a payload"
                        );
                        return Ok(ReportAccess::failed());
                    };
                    let generated_at = record.completed_at.unwrap_or_else(Utc::now);
                    return Ok(ReportAccess::ready(payload, generated_at));
                }
                SnapshotStatus::Failed => {
                    tracing::warn!(
                        org_id = %org_id,
                        attempt_id = %attempt_id,
                        error = record.error_message.as_deref().unwrap_or("unrecorded"),
                        "report render failed; surfacing failed status"
                    );
                    return Ok(ReportAccess::failed());
                }
                SnapshotStatus::Queued | SnapshotStatus::Running => {}
            },
        }

        if Instant::now() + poll > deadline_at {
            return Ok(ReportAccess::processing(poll_ms));
        }
        tokio::time::sleep(poll).await;
    }
}

/// Gate state embedded in a submit response: a single check, no waiting, and
/// never a reason to fail the submit.
pub async fn embed(state: &AppState, org_id: Uuid, attempt_id: Uuid) -> ReportAccess {
    match resolve(state, org_id, attempt_id, false, Duration::ZERO).await {
        Ok(access) => access,
        Err(e) => {
            tracing::warn!(
                org_id = %org_id,
                attempt_id = %attempt_id,
                "report gate degraded to locked: {e:?}"
            );
            ReportAccess::locked()
        }
    }
}

fn render_seed(org_id: Uuid, attempt_id: Uuid, trigger_source: &str) -> SnapshotSeed {
    SnapshotSeed {
        org_id,
        attempt_id,
        trigger_source: trigger_source.to_string(),
        order_no: None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use skala_core::report::ReportStatus;

    use crate::snapshots::SnapshotStatus;
    use crate::testing::{StateOverrides, test_state};

    use super::{embed, resolve};

    #[tokio::test]
    async fn unentitled_caller_gets_locked_stub_without_snapshot_reads() {
        let (state, probes) = test_state(StateOverrides {
            full_access: Some(false),
            ..StateOverrides::default()
        });
        let org_id = state.config.default_org_id;

        let access = resolve(&state, org_id, Uuid::now_v7(), false, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(access.status, ReportStatus::Locked);
        assert_eq!(probes.snapshots.fetch_count(), 0);
    }

    #[tokio::test]
    async fn finished_snapshot_returns_report_payload() {
        let (state, probes) = test_state(StateOverrides::default());
        let org_id = state.config.default_org_id;
        let attempt_id = Uuid::now_v7();
        probes
            .snapshots
            .set_status(SnapshotStatus::Success, Some(json!({"type": "INTJ"})));

        let access = resolve(&state, org_id, attempt_id, false, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(access.status, ReportStatus::Ready);
        assert_eq!(access.report, Some(json!({"type": "INTJ"})));
    }

    #[tokio::test]
    async fn failed_snapshot_surfaces_failed_without_payload() {
        let (state, probes) = test_state(StateOverrides::default());
        let org_id = state.config.default_org_id;
        probes.snapshots.set_failure("renderer exited nonzero");

        let access = resolve(&state, org_id, Uuid::now_v7(), false, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(access.status, ReportStatus::Failed);
        assert!(access.report.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_render_degrades_to_processing_at_the_deadline() {
        let (state, probes) = test_state(StateOverrides {
            snapshot_status: Some((SnapshotStatus::Running, None)),
            ..StateOverrides::default()
        });
        let org_id = state.config.default_org_id;

        let access = resolve(
            &state,
            org_id,
            Uuid::now_v7(),
            false,
            Duration::from_millis(2_500),
        )
        .await
        .unwrap();

        assert_eq!(access.status, ReportStatus::Processing);
        assert_eq!(access.poll_after_ms, Some(200));
        // 2.5s deadline at a 200ms poll interval: first check plus a dozen polls.
        assert!(probes.snapshots.fetch_count() >= 12);
    }

    #[tokio::test]
    async fn refresh_resets_the_snapshot_before_polling() {
        let (state, probes) = test_state(StateOverrides {
            snapshot_status: Some((SnapshotStatus::Queued, None)),
            ..StateOverrides::default()
        });
        let org_id = state.config.default_org_id;
        let attempt_id = Uuid::now_v7();

        let _ = resolve(&state, org_id, attempt_id, true, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(probes.snapshots.resets(), vec![attempt_id]);
    }

    #[tokio::test]
    async fn missing_snapshot_is_seeded_then_reported_processing() {
        let (state, probes) = test_state(StateOverrides {
            snapshot_missing: true,
            ..StateOverrides::default()
        });
        let org_id = state.config.default_org_id;
        let attempt_id = Uuid::now_v7();

        let access = resolve(&state, org_id, attempt_id, false, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(access.status, ReportStatus::Processing);
        assert_eq!(probes.snapshots.seeded(), vec![attempt_id]);
    }

    #[tokio::test]
    async fn embed_swallows_gate_failures_as_locked() {
        let (state, _probes) = test_state(StateOverrides {
            entitlement_error: true,
            ..StateOverrides::default()
        });
        let org_id = state.config.default_org_id;

        let access = embed(&state, org_id, Uuid::now_v7()).await;
        assert_eq!(access.status, ReportStatus::Locked);
    }
}
