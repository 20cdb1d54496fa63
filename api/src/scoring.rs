use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use skala_core::answers::AnswerEntry;

const SCORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Input handed to the scoring engine: the canonical answer set plus the
/// pack it must be scored against.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub scale_code: String,
    pub pack_version: String,
    pub answers: Vec<AnswerEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Everything the engine computed for one attempt. `result` is the full
/// engine output and is persisted verbatim; the scalar fields are lifted
/// out for querying.
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub result: serde_json::Value,
    pub type_code: Option<String>,
    pub score: Option<f64>,
    pub percentile: Option<f64>,
    pub pack_version: String,
    pub scoring_spec_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("scoring engine unreachable: {0}")]
    Transport(String),
    #[error("scoring engine returned {status}")]
    Status { status: u16, body: String },
    #[error("scoring engine response malformed: {0}")]
    Decode(String),
}

/// Boundary to the scoring service. The production implementation speaks
/// HTTP; tests substitute an in-memory engine.
#[async_trait]
pub trait ScoringEngine: Send + Sync {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreOutcome, ScoringError>;
}

pub struct HttpScoringEngine {
    client: reqwest::Client,
    score_url: Url,
}

#[derive(Debug, Deserialize)]
struct EngineScoreResponse {
    result: serde_json::Value,
    #[serde(default)]
    type_code: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    percentile: Option<f64>,
    #[serde(default)]
    pack_version: Option<String>,
    scoring_spec_version: String,
}

impl HttpScoringEngine {
    pub fn new(base: &Url) -> Self {
        let score_url = base
            .join("v1/score")
            .unwrap_or_else(|_| base.clone());
        Self {
            client: reqwest::Client::new(),
            score_url,
        }
    }
}

#[async_trait]
impl ScoringEngine for HttpScoringEngine {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreOutcome, ScoringError> {
        let response = self
            .client
            .post(self.score_url.clone())
            .timeout(SCORE_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| ScoringError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                scale_code = %request.scale_code,
                status = status.as_u16(),
                "scoring engine returned non-success status"
            );
            return Err(ScoringError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let engine = response
            .json::<EngineScoreResponse>()
            .await
            .map_err(|e| ScoringError::Decode(e.to_string()))?;

        Ok(ScoreOutcome {
            result: engine.result,
            type_code: engine.type_code,
            score: engine.score,
            percentile: engine.percentile,
            pack_version: engine.pack_version.unwrap_or(request.pack_version),
            scoring_spec_version: engine.scoring_spec_version,
        })
    }
}
