use std::time::Duration;

use url::Url;
use uuid::Uuid;

/// Retake policy knobs. Both checks are optional and independent.
#[derive(Debug, Clone, Copy)]
pub struct RetakePolicy {
    /// No new attempt within this many hours of the most recent one
    pub cooldown_hours: Option<i64>,
    /// At most this many attempts inside the rolling window
    pub window_cap: Option<i64>,
    /// Rolling window length in days
    pub window_days: i64,
}

/// Bounded synchronous wait for report generation.
#[derive(Debug, Clone, Copy)]
pub struct ReportWaitPolicy {
    pub deadline: Duration,
    pub poll_interval: Duration,
}

/// All runtime configuration, resolved once in `main` and passed down
/// explicitly. Components never read environment variables themselves.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// Org attributed to anonymous traffic without an explicit org header
    pub default_org_id: Uuid,
    /// Progress draft lifetime in days
    pub draft_ttl_days: i64,
    pub retake: RetakePolicy,
    pub report_wait: ReportWaitPolicy,
    /// Base URL of the scoring engine service
    pub scoring_url: Url,
    /// When false, submissions never consume wallet credits and report
    /// entitlements are granted unconditionally
    pub credit_enforced: bool,
    /// Benefit consumed for invite-attached (B2B) attempts
    pub b2b_benefit_code: String,
    /// Allowed browser origins
    pub cors_origins: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl AppConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Separated from `from_env`
    /// so configuration parsing is testable without mutating process state.
    pub fn resolve(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let port = parse_or("PORT", &var, 3000u16)?;
        let default_org_id: Uuid = required_parsed("SKALA_DEFAULT_ORG_ID", &var)?;
        let draft_ttl_days = parse_or("SKALA_DRAFT_TTL_DAYS", &var, 7i64)?;

        let retake = RetakePolicy {
            cooldown_hours: optional_parsed("SKALA_RETAKE_COOLDOWN_HOURS", &var)?,
            window_cap: optional_parsed("SKALA_RETAKE_WINDOW_CAP", &var)?,
            window_days: parse_or("SKALA_RETAKE_WINDOW_DAYS", &var, 30i64)?,
        };

        let report_wait = ReportWaitPolicy {
            deadline: Duration::from_millis(parse_or("SKALA_REPORT_WAIT_MS", &var, 2_500u64)?),
            poll_interval: Duration::from_millis(parse_or("SKALA_REPORT_POLL_MS", &var, 200u64)?),
        };

        let scoring_url_raw = var("SCORING_URL").ok_or(ConfigError::Missing("SCORING_URL"))?;
        let scoring_url = Url::parse(&scoring_url_raw).map_err(|e| ConfigError::Invalid {
            name: "SCORING_URL",
            reason: e.to_string(),
        })?;

        let credit_enforced = var("SKALA_CREDIT_ENFORCED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let b2b_benefit_code =
            var("SKALA_B2B_BENEFIT").unwrap_or_else(|| "b2b_credit".to_string());

        let cors_origins = var("SKALA_CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        Ok(Self {
            database_url,
            port,
            default_org_id,
            draft_ttl_days,
            retake,
            report_wait,
            scoring_url,
            credit_enforced,
            b2b_benefit_code,
            cors_origins,
        })
    }

    pub fn draft_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.draft_ttl_days)
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    var: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn required_parsed<T: std::str::FromStr>(
    name: &'static str,
    var: &impl Fn(&str) -> Option<String>,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = var(name).ok_or(ConfigError::Missing(name))?;
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn optional_parsed<T: std::str::FromStr>(
    name: &'static str,
    var: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::AppConfig;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/skala".to_string()),
            (
                "SKALA_DEFAULT_ORG_ID",
                "0189f6d2-0000-7000-8000-000000000000".to_string(),
            ),
            ("SCORING_URL", "http://localhost:9100".to_string()),
        ])
    }

    fn resolve(vars: &HashMap<&'static str, String>) -> AppConfig {
        AppConfig::resolve(|name| vars.get(name).cloned()).expect("config must resolve")
    }

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let config = resolve(&base_vars());
        assert_eq!(config.port, 3000);
        assert_eq!(config.draft_ttl_days, 7);
        assert_eq!(config.retake.cooldown_hours, None);
        assert_eq!(config.retake.window_cap, None);
        assert_eq!(config.retake.window_days, 30);
        assert!(config.credit_enforced);
        assert_eq!(config.b2b_benefit_code, "b2b_credit");
    }

    #[test]
    fn retake_policy_parses_from_vars() {
        let mut vars = base_vars();
        vars.insert("SKALA_RETAKE_COOLDOWN_HOURS", "24".to_string());
        vars.insert("SKALA_RETAKE_WINDOW_CAP", "3".to_string());

        let config = resolve(&vars);
        assert_eq!(config.retake.cooldown_hours, Some(24));
        assert_eq!(config.retake.window_cap, Some(3));
    }

    #[test]
    fn empty_optional_var_reads_as_unset() {
        let mut vars = base_vars();
        vars.insert("SKALA_RETAKE_COOLDOWN_HOURS", "  ".to_string());
        assert_eq!(resolve(&vars).retake.cooldown_hours, None);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let mut vars = base_vars();
        vars.remove("DATABASE_URL");
        assert!(AppConfig::resolve(|name| vars.get(name).cloned()).is_err());
    }

    #[test]
    fn invalid_scoring_url_is_an_error() {
        let mut vars = base_vars();
        vars.insert("SCORING_URL", "not a url".to_string());
        assert!(AppConfig::resolve(|name| vars.get(name).cloned()).is_err());
    }

    #[test]
    fn credit_enforcement_can_be_disabled() {
        let mut vars = base_vars();
        vars.insert("SKALA_CREDIT_ENFORCED", "false".to_string());
        assert!(!resolve(&vars).credit_enforced);
    }

    #[test]
    fn cors_origins_split_and_trim() {
        let mut vars = base_vars();
        vars.insert(
            "SKALA_CORS_ORIGINS",
            "https://app.skala.dev, https://staging.skala.dev,".to_string(),
        );
        assert_eq!(
            resolve(&vars).cors_origins,
            vec![
                "https://app.skala.dev".to_string(),
                "https://staging.skala.dev".to_string()
            ]
        );
    }
}
