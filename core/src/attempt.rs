use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::answers::AnswerEntry;
use crate::report::ReportAccess;

/// Request to start a new attempt on a scale.
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartAttemptRequest {
    /// Scale code from the content catalog (e.g. "big5", "mbti_lite")
    pub scale_code: String,
    /// Device identifier for analytics (free-form)
    #[serde(default)]
    pub device: Option<String>,
    /// Acquisition channel (e.g. "web", "ios", "b2b_invite")
    #[serde(default)]
    pub channel: Option<String>,
}

/// A started attempt: the resume token is returned exactly once, here.
/// Clients must persist it — the server only stores its hash.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartAttemptResponse {
    pub attempt_id: Uuid,
    /// Credential for progress writes on this attempt (`skala_rt_…`)
    pub resume_token: String,
    /// When the progress draft expires
    pub expires_at: DateTime<Utc>,
    /// Number of questions in the resolved content pack
    pub question_count: i32,
}

/// Final submission of an attempt.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitAttemptRequest {
    /// Final answers. Questions answered only in the progress draft are
    /// merged in server-side; request entries win on collision.
    pub answers: Vec<AnswerEntry>,
    /// Total time spent, as measured by the client
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// B2B invite token (`skala_inv_…`) to attach this attempt to
    #[serde(default)]
    pub invite_token: Option<String>,
}

/// Outcome of a (possibly replayed) submission.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitAttemptResponse {
    pub attempt_id: Uuid,
    /// Derived type code when the scale produces one (e.g. "INTJ")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_code: Option<String>,
    /// Opaque scoring-engine output
    pub scores: serde_json::Value,
    /// Content pack version the answers were scored against
    pub pack_version: String,
    /// Scoring spec version reported by the engine
    pub scoring_spec_version: String,
    /// True when this response replayed an earlier identical submission
    pub idempotent: bool,
    /// Live report access embedded in the submit response
    pub report: ReportAccess,
}

/// Response to a redaction request. The attempt row survives for audit;
/// answer and result payloads do not.
#[derive(Debug, Serialize, ToSchema)]
pub struct RedactAttemptResponse {
    pub attempt_id: Uuid,
    pub redacted_at: DateTime<Utc>,
}

/// One row in an attempt history listing.
#[derive(Debug, Serialize, ToSchema)]
pub struct AttemptListItem {
    pub attempt_id: Uuid,
    pub scale_code: String,
    pub pack_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// True once answer/result payloads were purged
    pub redacted: bool,
}

/// Cursor-based pagination wrapper.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T: Serialize> {
    pub data: Vec<T>,
    /// Pass back as `cursor` to fetch the next page; absent on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}
