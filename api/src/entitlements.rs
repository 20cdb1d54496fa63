use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Benefit code recorded when a submission unlocks the full report.
pub const REPORT_UNLOCK_BENEFIT: &str = "report_unlock";

#[derive(Debug, Clone)]
pub struct AttemptUnlock {
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub user_id: Option<Uuid>,
    pub anon_id: Option<String>,
    /// Where the grant came from ("submit", "invite", ...)
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
#[error("entitlement store failure: {0}")]
pub struct EntitlementError(#[from] sqlx::Error);

/// Report-access grants. A grant is attempt-scoped and written at most once;
/// replayed submissions hit the unique key and are no-ops.
#[async_trait]
pub trait EntitlementManager: Send + Sync {
    async fn has_full_access(
        &self,
        org_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<bool, EntitlementError>;

    async fn grant_attempt_unlock(&self, unlock: AttemptUnlock) -> Result<(), EntitlementError>;
}

pub struct PgEntitlementManager {
    db: PgPool,
}

impl PgEntitlementManager {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EntitlementManager for PgEntitlementManager {
    async fn has_full_access(
        &self,
        org_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<bool, EntitlementError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM benefit_grants
                WHERE org_id = $1 AND benefit_code = $2 AND attempt_id = $3
            )
            "#,
        )
        .bind(org_id)
        .bind(REPORT_UNLOCK_BENEFIT)
        .bind(attempt_id)
        .fetch_one(&self.db)
        .await?;
        Ok(exists)
    }

    async fn grant_attempt_unlock(&self, unlock: AttemptUnlock) -> Result<(), EntitlementError> {
        sqlx::query(
            r#"
            INSERT INTO benefit_grants (id, org_id, benefit_code, attempt_id, user_id, anon_id, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id, benefit_code, attempt_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(unlock.org_id)
        .bind(REPORT_UNLOCK_BENEFIT)
        .bind(unlock.attempt_id)
        .bind(unlock.user_id)
        .bind(unlock.anon_id)
        .bind(unlock.source)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
