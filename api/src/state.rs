use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::DraftCache;
use crate::config::AppConfig;
use crate::entitlements::{EntitlementManager, PgEntitlementManager};
use crate::recorder::{EventRecorder, PgEventRecorder};
use crate::scoring::{HttpScoringEngine, ScoringEngine};
use crate::snapshots::{PgReportSnapshots, ReportSnapshots};
use crate::wallet::{BenefitWallet, PgBenefitWallet};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub drafts: DraftCache,
    pub scoring: Arc<dyn ScoringEngine>,
    pub wallet: Arc<dyn BenefitWallet>,
    pub entitlements: Arc<dyn EntitlementManager>,
    pub snapshots: Arc<dyn ReportSnapshots>,
    pub events: Arc<dyn EventRecorder>,
}

impl AppState {
    /// Wire the production collaborators against the shared pool.
    pub fn new(db: PgPool, config: AppConfig) -> Self {
        let scoring = Arc::new(HttpScoringEngine::new(&config.scoring_url));
        Self {
            scoring,
            wallet: Arc::new(PgBenefitWallet::new(db.clone())),
            entitlements: Arc::new(PgEntitlementManager::new(db.clone())),
            snapshots: Arc::new(PgReportSnapshots::new(db.clone())),
            events: Arc::new(PgEventRecorder::new(db.clone())),
            drafts: DraftCache::new(),
            config: Arc::new(config),
            db,
        }
    }
}
