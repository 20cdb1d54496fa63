use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Analytics event emitted after a state change commits.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub name: &'static str,
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub anon_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Best-effort event sink. Recording never blocks or fails a request;
/// a lost event is acceptable, a lost submission is not.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: DomainEvent);
}

pub struct PgEventRecorder {
    db: PgPool,
}

impl PgEventRecorder {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventRecorder for PgEventRecorder {
    async fn record(&self, event: DomainEvent) {
        let pool = self.db.clone();
        tokio::spawn(async move {
            let written = sqlx::query(
                r#"
                INSERT INTO domain_events (id, event_name, org_id, user_id, anon_id, payload)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(event.name)
            .bind(event.org_id)
            .bind(event.user_id)
            .bind(event.anon_id)
            .bind(event.payload)
            .execute(&pool)
            .await;
            if let Err(e) = written {
                tracing::warn!(event_name = event.name, "failed to record domain event: {e}");
            }
        });
    }
}
