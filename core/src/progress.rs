use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::answers::AnswerEntry;

/// Incremental progress write for an in-flight attempt.
///
/// `seq` makes the write idempotent: the server rejects anything below the
/// last sequence it applied, so delayed retries can never roll progress back.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveProgressRequest {
    /// Client-side monotonic sequence number for this attempt
    pub seq: i64,
    /// Opaque client position marker (page, question index, …)
    #[serde(default)]
    pub cursor: Option<String>,
    /// Time spent so far, as measured by the client
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Answers captured since the last save. Merged by question id,
    /// incoming wins.
    #[serde(default)]
    pub answers: Vec<AnswerEntry>,
}

/// Current merged draft state, returned by both progress writes and reads.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProgressSnapshot {
    pub attempt_id: Uuid,
    /// Last applied sequence number
    pub last_seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Number of distinct questions answered so far
    pub answered_count: i32,
    /// The merged per-question answers
    pub answers: Vec<AnswerEntry>,
    /// When this draft expires
    pub expires_at: DateTime<Utc>,
}
