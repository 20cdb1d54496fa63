use std::sync::LazyLock;

use regex::Regex;
use sqlx::PgPool;

use crate::error::AppError;

static SCALE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid scale code regex"));

const SCALE_CODE_MAX_LEN: usize = 64;

/// Catalog entry for one questionnaire scale. The content pack itself lives
/// elsewhere; attempts only pin its id, version, and question count.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScalePack {
    pub code: String,
    pub pack_id: String,
    pub pack_version: String,
    pub question_count: i32,
}

pub fn validate_scale_code(raw: &str) -> Result<&str, AppError> {
    let code = raw.trim();
    if code.is_empty() || code.len() > SCALE_CODE_MAX_LEN || !SCALE_CODE_RE.is_match(code) {
        return Err(AppError::Validation {
            message: format!(
                "scale_code must match [a-z][a-z0-9_]* and be at most {SCALE_CODE_MAX_LEN} characters"
            ),
            field: Some("scale_code".to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: Some("Example: 'mbti_32'.".to_string()),
        });
    }
    Ok(code)
}

/// Look up an active scale. Inactive and unknown codes are indistinguishable
/// to callers.
pub async fn load_active_scale(pool: &PgPool, code: &str) -> Result<ScalePack, AppError> {
    sqlx::query_as::<_, ScalePack>(
        "SELECT code, pack_id, pack_version, question_count \
         FROM scales \
         WHERE code = $1 AND is_active = TRUE",
    )
    .bind(code)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("scale '{code}'"),
    })
}
