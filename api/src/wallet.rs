use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Benefit consumed for a direct (non-invite) attempt on a scale.
pub fn scale_credit_code(scale_code: &str) -> String {
    format!("scale_credit:{scale_code}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletOutcome {
    /// One credit was deducted for this attempt
    Consumed,
    /// This attempt already has a ledger entry; nothing was deducted
    AlreadyConsumed,
    /// No wallet row, or the balance was zero
    Insufficient,
}

impl WalletOutcome {
    pub fn granted(self) -> bool {
        matches!(self, Self::Consumed | Self::AlreadyConsumed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("wallet store failure: {0}")]
pub struct WalletError(#[from] sqlx::Error);

/// Credit accounting boundary. Consumption is keyed by attempt, so retrying
/// a submission can never charge twice.
#[async_trait]
pub trait BenefitWallet: Send + Sync {
    async fn consume(
        &self,
        org_id: Uuid,
        benefit_code: &str,
        attempt_id: Uuid,
    ) -> Result<WalletOutcome, WalletError>;
}

pub struct PgBenefitWallet {
    db: PgPool,
}

impl PgBenefitWallet {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BenefitWallet for PgBenefitWallet {
    async fn consume(
        &self,
        org_id: Uuid,
        benefit_code: &str,
        attempt_id: Uuid,
    ) -> Result<WalletOutcome, WalletError> {
        let mut tx = self.db.begin().await?;

        // The ledger row is the dedupe anchor: a replayed submission hits the
        // unique key and deducts nothing.
        let ledger = sqlx::query(
            r#"
            INSERT INTO wallet_ledger (id, org_id, benefit_code, attempt_id, delta, reason)
            VALUES ($1, $2, $3, $4, -1, 'attempt_submit')
            ON CONFLICT (org_id, benefit_code, attempt_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(org_id)
        .bind(benefit_code)
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

        if ledger.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(WalletOutcome::AlreadyConsumed);
        }

        let deducted = sqlx::query(
            r#"
            UPDATE benefit_wallets
            SET balance = balance - 1, updated_at = now()
            WHERE org_id = $1 AND benefit_code = $2 AND balance >= 1
            "#,
        )
        .bind(org_id)
        .bind(benefit_code)
        .execute(&mut *tx)
        .await?;

        if deducted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(WalletOutcome::Insufficient);
        }

        tx.commit().await?;
        Ok(WalletOutcome::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::{WalletOutcome, scale_credit_code};

    #[test]
    fn scale_credit_code_embeds_scale() {
        assert_eq!(scale_credit_code("mbti_32"), "scale_credit:mbti_32");
    }

    #[test]
    fn replayed_consume_still_counts_as_granted() {
        assert!(WalletOutcome::Consumed.granted());
        assert!(WalletOutcome::AlreadyConsumed.granted());
        assert!(!WalletOutcome::Insufficient.granted());
    }
}
