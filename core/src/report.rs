use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Where a report stands from the caller's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Entitled and generated — payload present
    Ready,
    /// Entitled, generation still queued/running — poll again
    Processing,
    /// Not entitled — payload withheld
    Locked,
    /// Generation failed; a refresh may be attempted
    Failed,
}

/// Report access payload, embedded in submit responses and returned from the
/// report endpoint. `report` is only present when `status == ready`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReportAccess {
    pub status: ReportStatus,
    /// Rendered report payload (opaque to this service)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<serde_json::Value>,
    /// When the payload was generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    /// Suggested client poll delay while processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_after_ms: Option<u64>,
}

impl ReportAccess {
    /// The stub returned to unentitled callers, and whenever the gate fails:
    /// a successful submit never turns into an error because of its report.
    pub fn locked() -> Self {
        Self {
            status: ReportStatus::Locked,
            report: None,
            generated_at: None,
            poll_after_ms: None,
        }
    }

    pub fn processing(poll_after_ms: u64) -> Self {
        Self {
            status: ReportStatus::Processing,
            report: None,
            generated_at: None,
            poll_after_ms: Some(poll_after_ms),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: ReportStatus::Failed,
            report: None,
            generated_at: None,
            poll_after_ms: None,
        }
    }

    pub fn ready(report: serde_json::Value, generated_at: DateTime<Utc>) -> Self {
        Self {
            status: ReportStatus::Ready,
            report: Some(report),
            generated_at: Some(generated_at),
            poll_after_ms: None,
        }
    }
}
