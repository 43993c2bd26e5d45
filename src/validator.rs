//! Submission validation for sandbox runs
//!
//! Checks run in a fixed order so a request with several problems always
//! gets the same error: empty snippet, size, NUL bytes, verdict hint,
//! language, then incident existence.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::auth::AuthenticatedUser;
use crate::config::{Config, OneLanguageConfig};
use crate::database as db;
use crate::error::{GatewayError, GatewayResult};
use crate::models::SandboxRequest;
use crate::verdict::Verdict;

/// A submission that passed every check and may be scheduled
#[derive(Debug, Clone)]
pub struct ValidatedSubmission {
    pub incident_id: String,
    pub snippet: String,
    pub language: OneLanguageConfig,
}

/// Validates the snippet text alone and returns its normalized form
pub fn check_snippet(snippet: &str, max_bytes: usize) -> GatewayResult<String> {
    if snippet.trim().is_empty() {
        return Err(GatewayError::InvalidInput(
            "Snippet must not be empty".to_string(),
        ));
    }
    if snippet.len() > max_bytes {
        return Err(GatewayError::InvalidInput(format!(
            "Snippet is {} bytes, the limit is {max_bytes} bytes",
            snippet.len()
        )));
    }
    if snippet.contains('\0') {
        return Err(GatewayError::InvalidInput(
            "Snippet must not contain NUL bytes".to_string(),
        ));
    }

    let mut normalized = snippet.replace("\r\n", "\n");
    if !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    Ok(normalized)
}

/// Only the placeholder `Unknown` may be sent; the gateway assigns verdicts
pub fn check_verdict_hint(hint: Option<&str>) -> GatewayResult<()> {
    match hint {
        None => Ok(()),
        Some(value) if value.parse::<Verdict>() == Ok(Verdict::Unknown) => Ok(()),
        Some(value) => Err(GatewayError::InvalidInput(format!(
            "verdict is assigned by the sandbox; expected \"Unknown\", got \"{value}\""
        ))),
    }
}

pub fn resolve_language<'a>(
    requested: Option<&str>,
    config: &'a Config,
) -> GatewayResult<&'a OneLanguageConfig> {
    let name = requested.unwrap_or(&config.sandbox.default_language);
    config
        .find_language(name)
        .ok_or_else(|| GatewayError::InvalidInput(format!("Unsupported language {name}")))
}

/// Runs every check, ending with the incident lookup
///
/// Incidents owned by other users are reported as missing.
pub async fn validate_submission(
    incident_id: &str,
    body: &SandboxRequest,
    config: &Config,
    caller: &AuthenticatedUser,
    pool: Arc<SqlitePool>,
) -> GatewayResult<ValidatedSubmission> {
    let snippet = check_snippet(&body.snippet_executed, config.sandbox.max_snippet_bytes)?;
    check_verdict_hint(body.verdict.as_deref())?;
    let language = resolve_language(body.language.as_deref(), config)?.clone();

    match db::incident_owner(incident_id, pool).await? {
        Some(owner) if owner == caller.user_id => Ok(ValidatedSubmission {
            incident_id: incident_id.to_string(),
            snippet,
            language,
        }),
        _ => Err(GatewayError::NotFound(format!(
            "Incident {incident_id} not found"
        ))),
    }
}
