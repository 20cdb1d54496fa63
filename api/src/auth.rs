use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use skala_core::identity::Identity;
use skala_core::token::hash_token;

use crate::error::AppError;
use crate::state::AppState;

pub const ANON_ID_HEADER: &str = "x-anon-id";
pub const ORG_ID_HEADER: &str = "x-org-id";
pub const RESUME_TOKEN_HEADER: &str = "x-resume-token";

/// Who is making this request.
///
/// Resolution order: a Bearer session token wins, then an `X-Anon-Id`
/// header. Presented credentials must be valid, but absence is not an
/// error — resume-token-guarded endpoints work without any identity, and
/// everything else checks `identity.is_resolvable()` itself.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: Identity,
}

impl Caller {
    /// Reject requests that arrived with neither a session nor an anon id.
    pub fn require_owner(&self) -> Result<&Identity, AppError> {
        if self.identity.is_resolvable() {
            Ok(&self.identity)
        } else {
            Err(AppError::Unauthorized {
                message: "Authentication or an anonymous id is required".to_string(),
                docs_hint: Some(format!(
                    "Send 'Authorization: Bearer skala_st_...' or an '{ANON_ID_HEADER}' header."
                )),
            })
        }
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let org_override = org_from_headers(&parts.headers)?;
        let default_org = org_override.unwrap_or(state.config.default_org_id);

        if let Some(token) = bearer_token(&parts.headers)? {
            let session = authenticate_session(&token, &state.db).await?;
            return Ok(Self {
                identity: Identity::authenticated(session.user_id, session.org_id),
            });
        }

        if let Some(anon_id) = anon_id_from_headers(&parts.headers)? {
            return Ok(Self {
                identity: Identity::anonymous(anon_id, default_org),
            });
        }

        Ok(Self {
            identity: Identity {
                user_id: None,
                anon_id: None,
                org_id: default_org,
            },
        })
    }
}

/// Resume token presented for draft access, independent of identity.
pub fn resume_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(RESUME_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(raw) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let token = raw
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized {
            message: "Authorization header must use Bearer scheme".to_string(),
            docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
        })?;
    if !token.starts_with("skala_st_") {
        return Err(AppError::Unauthorized {
            message: "Invalid token format".to_string(),
            docs_hint: Some("Session tokens start with 'skala_st_'.".to_string()),
        });
    }
    Ok(Some(token.to_string()))
}

fn anon_id_from_headers(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(raw) = headers.get(ANON_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let anon_id = raw.trim();
    let valid_shape = (8..=128).contains(&anon_id.len())
        && anon_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid_shape {
        return Err(AppError::Validation {
            message: "anonymous id must be 8-128 characters of [A-Za-z0-9._-]".to_string(),
            field: Some(ANON_ID_HEADER.to_string()),
            received: Some(serde_json::Value::String(anon_id.to_string())),
            docs_hint: Some("Generate a stable random id per device, e.g. a UUID.".to_string()),
        });
    }
    Ok(Some(anon_id.to_string()))
}

fn org_from_headers(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    let Some(raw) = headers.get(ORG_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<Uuid>()
        .map(Some)
        .map_err(|_| AppError::Validation {
            message: "org id must be a UUID".to_string(),
            field: Some(ORG_ID_HEADER.to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: None,
        })
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    org_id: Uuid,
    expires_at: Option<DateTime<Utc>>,
}

async fn authenticate_session(token: &str, pool: &sqlx::PgPool) -> Result<SessionRow, AppError> {
    let token_hash = hash_token(token);

    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT st.id, st.user_id, u.org_id, st.expires_at \
         FROM session_tokens st \
         JOIN users u ON u.id = st.user_id \
         WHERE st.token_hash = $1 \
           AND st.is_revoked = FALSE \
           AND u.is_active = TRUE",
    )
    .bind(&token_hash)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::Unauthorized {
        message: "Invalid session token".to_string(),
        docs_hint: Some("Check that the token is correct and has not been revoked.".to_string()),
    })?;

    if let Some(expires_at) = row.expires_at {
        if Utc::now() > expires_at {
            return Err(AppError::Unauthorized {
                message: "Session token has expired".to_string(),
                docs_hint: Some("Start a new session to obtain a fresh token.".to_string()),
            });
        }
    }

    // Fire-and-forget last_used_at update
    let pool_clone = pool.clone();
    let session_id = row.id;
    tokio::spawn(async move {
        let _ = sqlx::query("UPDATE session_tokens SET last_used_at = NOW() WHERE id = $1")
            .bind(session_id)
            .execute(&pool_clone)
            .await;
    });

    Ok(row)
}
