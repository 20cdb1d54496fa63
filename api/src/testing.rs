//! Stub collaborators for exercising submit and report flows.
//!
//! `test_state` carries a lazy, never-connected pool for tests that stay off
//! the database; `test_state_on` swaps in a live pool for the SQL-bound
//! tests that run when `DATABASE_URL` is set.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use url::Url;
use uuid::Uuid;

use crate::cache::DraftCache;
use crate::config::{AppConfig, ReportWaitPolicy, RetakePolicy};
use crate::entitlements::{AttemptUnlock, EntitlementError, EntitlementManager};
use crate::recorder::{DomainEvent, EventRecorder};
use crate::scoring::{ScoreOutcome, ScoreRequest, ScoringEngine, ScoringError};
use crate::snapshots::{
    ReportSnapshots, SnapshotError, SnapshotRecord, SnapshotSeed, SnapshotStatus,
};
use crate::state::AppState;
use crate::wallet::{BenefitWallet, WalletError, WalletOutcome};

/// Per-test deviations from the defaults: enforced credits, full access,
/// a queued snapshot row, and a wallet that consumes successfully.
#[derive(Default)]
pub struct StateOverrides {
    pub wallet_outcome: Option<WalletOutcome>,
    pub credit_enforced: Option<bool>,
    pub full_access: Option<bool>,
    pub snapshot_status: Option<(SnapshotStatus, Option<serde_json::Value>)>,
    /// Start without a snapshot row at all
    pub snapshot_missing: bool,
    /// Make entitlement lookups fail
    pub entitlement_error: bool,
}

/// Handles onto the stubs inside a test state, for asserting what the code
/// under test did to its collaborators.
pub struct Probes {
    pub scoring: Arc<StubScoring>,
    pub wallet: Arc<StubWallet>,
    pub entitlements: Arc<StubEntitlements>,
    pub snapshots: Arc<StubSnapshots>,
    pub recorder: Arc<StubRecorder>,
}

pub fn test_state(overrides: StateOverrides) -> (AppState, Probes) {
    let db = PgPoolOptions::new()
        .connect_lazy("postgres://localhost/skala_test")
        .unwrap();
    test_state_on(db, overrides)
}

/// Same stubs on the given pool, for tests that exercise real SQL.
pub fn test_state_on(db: PgPool, overrides: StateOverrides) -> (AppState, Probes) {
    let scoring = Arc::new(StubScoring::default());
    let wallet = Arc::new(StubWallet::new(
        overrides.wallet_outcome.unwrap_or(WalletOutcome::Consumed),
    ));
    let entitlements = Arc::new(StubEntitlements::new(
        overrides.full_access.unwrap_or(true),
        overrides.entitlement_error,
    ));
    let initial = if overrides.snapshot_missing {
        None
    } else {
        let (status, payload) = overrides
            .snapshot_status
            .unwrap_or((SnapshotStatus::Queued, None));
        Some(record_for(status, payload))
    };
    let snapshots = Arc::new(StubSnapshots::new(initial));
    let recorder = Arc::new(StubRecorder::default());

    let config = AppConfig {
        database_url: "postgres://localhost/skala_test".to_string(),
        port: 0,
        default_org_id: Uuid::now_v7(),
        draft_ttl_days: 7,
        retake: RetakePolicy {
            cooldown_hours: None,
            window_cap: None,
            window_days: 30,
        },
        report_wait: ReportWaitPolicy {
            deadline: Duration::from_millis(2_500),
            poll_interval: Duration::from_millis(200),
        },
        scoring_url: Url::parse("http://scoring.test.invalid/").unwrap(),
        credit_enforced: overrides.credit_enforced.unwrap_or(true),
        b2b_benefit_code: "b2b_credit".to_string(),
        cors_origins: vec!["http://localhost:3000".to_string()],
    };

    let state = AppState {
        db,
        config: Arc::new(config),
        drafts: DraftCache::new(),
        scoring: scoring.clone(),
        wallet: wallet.clone(),
        entitlements: entitlements.clone(),
        snapshots: snapshots.clone(),
        events: recorder.clone(),
    };

    (
        state,
        Probes {
            scoring,
            wallet,
            entitlements,
            snapshots,
            recorder,
        },
    )
}

fn record_for(status: SnapshotStatus, payload: Option<serde_json::Value>) -> SnapshotRecord {
    SnapshotRecord {
        status,
        payload,
        completed_at: None,
        error_message: None,
    }
}

// ────────────────────────────── wallet ──────────────────────────────

pub struct StubWallet {
    outcome: WalletOutcome,
    calls: Mutex<Vec<(Uuid, String, Uuid)>>,
}

impl StubWallet {
    fn new(outcome: WalletOutcome) -> Self {
        Self {
            outcome,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn consumed(&self) -> Vec<(Uuid, String, Uuid)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BenefitWallet for StubWallet {
    async fn consume(
        &self,
        org_id: Uuid,
        benefit_code: &str,
        attempt_id: Uuid,
    ) -> Result<WalletOutcome, WalletError> {
        self.calls
            .lock()
            .unwrap()
            .push((org_id, benefit_code.to_string(), attempt_id));
        Ok(self.outcome)
    }
}

// ─────────────────────────── entitlements ───────────────────────────

pub struct StubEntitlements {
    full_access: bool,
    fail: bool,
    grants: Mutex<Vec<AttemptUnlock>>,
}

impl StubEntitlements {
    fn new(full_access: bool, fail: bool) -> Self {
        Self {
            full_access,
            fail,
            grants: Mutex::new(Vec::new()),
        }
    }

    pub fn granted(&self) -> Vec<Uuid> {
        self.grants
            .lock()
            .unwrap()
            .iter()
            .map(|unlock| unlock.attempt_id)
            .collect()
    }
}

#[async_trait]
impl EntitlementManager for StubEntitlements {
    async fn has_full_access(
        &self,
        _org_id: Uuid,
        _attempt_id: Uuid,
    ) -> Result<bool, EntitlementError> {
        if self.fail {
            return Err(EntitlementError::from(sqlx::Error::PoolClosed));
        }
        Ok(self.full_access)
    }

    async fn grant_attempt_unlock(&self, unlock: AttemptUnlock) -> Result<(), EntitlementError> {
        if self.fail {
            return Err(EntitlementError::from(sqlx::Error::PoolClosed));
        }
        self.grants.lock().unwrap().push(unlock);
        Ok(())
    }
}

// ──────────────────────────── snapshots ─────────────────────────────

pub struct StubSnapshots {
    record: Mutex<Option<SnapshotRecord>>,
    seeds: Mutex<Vec<Uuid>>,
    resets: Mutex<Vec<Uuid>>,
    fetches: Mutex<usize>,
}

impl StubSnapshots {
    fn new(initial: Option<SnapshotRecord>) -> Self {
        Self {
            record: Mutex::new(initial),
            seeds: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            fetches: Mutex::new(0),
        }
    }

    pub fn seeded(&self) -> Vec<Uuid> {
        self.seeds.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<Uuid> {
        self.resets.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }

    pub fn set_status(&self, status: SnapshotStatus, payload: Option<serde_json::Value>) {
        *self.record.lock().unwrap() = Some(record_for(status, payload));
    }

    pub fn set_failure(&self, message: &str) {
        *self.record.lock().unwrap() = Some(SnapshotRecord {
            status: SnapshotStatus::Failed,
            payload: None,
            completed_at: None,
            error_message: Some(message.to_string()),
        });
    }
}

#[async_trait]
impl ReportSnapshots for StubSnapshots {
    async fn seed(&self, seed: SnapshotSeed) -> Result<(), SnapshotError> {
        self.seeds.lock().unwrap().push(seed.attempt_id);
        let mut record = self.record.lock().unwrap();
        if record.is_none() {
            *record = Some(record_for(SnapshotStatus::Queued, None));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        _org_id: Uuid,
        _attempt_id: Uuid,
    ) -> Result<Option<SnapshotRecord>, SnapshotError> {
        *self.fetches.lock().unwrap() += 1;
        Ok(self.record.lock().unwrap().clone())
    }

    async fn reset_to_queued(&self, seed: SnapshotSeed) -> Result<(), SnapshotError> {
        self.resets.lock().unwrap().push(seed.attempt_id);
        *self.record.lock().unwrap() = Some(record_for(SnapshotStatus::Queued, None));
        Ok(())
    }
}

// ───────────────────────────── recorder ─────────────────────────────

#[derive(Default)]
pub struct StubRecorder {
    events: Mutex<Vec<DomainEvent>>,
}

impl StubRecorder {
    pub fn recorded(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventRecorder for StubRecorder {
    async fn record(&self, event: DomainEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ───────────────────────────── scoring ──────────────────────────────

/// Scores every request the same way and counts invocations; the submit
/// tests assert a committed attempt is never scored a second time.
#[derive(Default)]
pub struct StubScoring {
    calls: Mutex<usize>,
}

impl StubScoring {
    pub fn score_calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ScoringEngine for StubScoring {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreOutcome, ScoringError> {
        *self.calls.lock().unwrap() += 1;
        Ok(ScoreOutcome {
            result: serde_json::json!({ "dimensions": {} }),
            type_code: Some("INTJ".to_string()),
            score: Some(42.0),
            percentile: Some(61.5),
            pack_version: request.pack_version,
            scoring_spec_version: "1.0.0".to_string(),
        })
    }
}
