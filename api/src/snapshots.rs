use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

const RENDER_JOB_TYPE: &str = "report_render";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl SnapshotStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// One rendered-report row as the poll loop sees it.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub status: SnapshotStatus,
    pub payload: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotSeed {
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub trigger_source: String,
    pub order_no: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("report snapshot store failure: {0}")]
pub struct SnapshotError(#[from] sqlx::Error);

/// Report generation state, one row per attempt, rendered out-of-band.
/// Seeding is idempotent: a replayed submission never resets a finished row.
#[async_trait]
pub trait ReportSnapshots: Send + Sync {
    /// Create the queued row and enqueue a render job, unless a row exists.
    async fn seed(&self, seed: SnapshotSeed) -> Result<(), SnapshotError>;

    async fn fetch(
        &self,
        org_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<Option<SnapshotRecord>, SnapshotError>;

    /// Force a re-render: status back to queued, stale payload cleared.
    async fn reset_to_queued(&self, seed: SnapshotSeed) -> Result<(), SnapshotError>;
}

pub struct PgReportSnapshots {
    db: PgPool,
}

impl PgReportSnapshots {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn enqueue_render(&self, seed: &SnapshotSeed) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            INSERT INTO background_jobs (job_type, payload)
            VALUES ($1, $2)
            "#,
        )
        .bind(RENDER_JOB_TYPE)
        .bind(json!({
            "org_id": seed.org_id,
            "attempt_id": seed.attempt_id,
            "trigger_source": seed.trigger_source,
            "order_no": seed.order_no,
        }))
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    status: String,
    payload: Option<serde_json::Value>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl SnapshotRow {
    fn into_record(self) -> SnapshotRecord {
        SnapshotRecord {
            status: SnapshotStatus::parse(&self.status),
            payload: self.payload,
            completed_at: self.completed_at,
            error_message: self.error_message,
        }
    }
}

#[async_trait]
impl ReportSnapshots for PgReportSnapshots {
    async fn seed(&self, seed: SnapshotSeed) -> Result<(), SnapshotError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO report_snapshots (org_id, attempt_id, status, trigger_source, order_no)
            VALUES ($1, $2, 'queued', $3, $4)
            ON CONFLICT (org_id, attempt_id) DO NOTHING
            "#,
        )
        .bind(seed.org_id)
        .bind(seed.attempt_id)
        .bind(&seed.trigger_source)
        .bind(&seed.order_no)
        .execute(&self.db)
        .await?;

        if inserted.rows_affected() == 1 {
            self.enqueue_render(&seed).await?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        org_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<Option<SnapshotRecord>, SnapshotError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT status, payload, completed_at, error_message
            FROM report_snapshots
            WHERE org_id = $1 AND attempt_id = $2
            "#,
        )
        .bind(org_id)
        .bind(attempt_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(SnapshotRow::into_record))
    }

    async fn reset_to_queued(&self, seed: SnapshotSeed) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            INSERT INTO report_snapshots (org_id, attempt_id, status, trigger_source, order_no)
            VALUES ($1, $2, 'queued', $3, $4)
            ON CONFLICT (org_id, attempt_id) DO UPDATE
            SET status = 'queued',
                payload = NULL,
                error_message = NULL,
                completed_at = NULL,
                trigger_source = EXCLUDED.trigger_source,
                updated_at = now()
            "#,
        )
        .bind(seed.org_id)
        .bind(seed.attempt_id)
        .bind(&seed.trigger_source)
        .bind(&seed.order_no)
        .execute(&self.db)
        .await?;

        self.enqueue_render(&seed).await?;
        Ok(())
    }
}
