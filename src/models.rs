//! Records exchanged over the API and stored in the database

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::sandbox::RunState;
use crate::sandbox::policy::PolicySignal;
use crate::verdict::Verdict;

#[derive(Serialize, Deserialize, sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Ambiguous,
}

#[derive(Serialize, Deserialize, sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentStatus {
    Open,
    Fixed,
    Dismissed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Fixed => "Fixed",
            Self::Dismissed => "Dismissed",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, sqlx::FromRow, Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub github_installation_id: Option<i64>,
    pub github_token_expires_at: Option<String>,
    pub created_at: String,
}

/// A user as shown to clients, without credentials
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub github_installation_id: Option<i64>,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            github_installation_id: user.github_installation_id,
            created_at: user.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct Repository {
    pub id: String,
    pub user_id: String,
    pub full_name: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct Incident {
    pub id: String,
    pub repo_id: String,
    pub pr_number: Option<i64>,
    pub workflow_path: String,
    pub severity: Severity,
    pub finding_type: String,
    pub description: String,
    pub status: IncidentStatus,
    pub created_at: String,
}

/// One execution of a snippet for an incident
///
/// Only terminal runs are stored, so `runtime_log` and `completed_at` are
/// set on every persisted record. `snippet_executed` is the text that ran:
/// the submitted snippet with CRLF line endings turned into LF and a final
/// newline added when missing.
#[derive(Serialize, Deserialize, sqlx::FromRow, Debug, Clone)]
pub struct SandboxRun {
    pub id: String,
    pub incident_id: String,
    pub snippet_executed: String,
    pub language: String,
    pub verdict: Verdict,
    pub outcome: RunState,
    pub policy_signals: Json<Vec<PolicySignal>>,
    pub runtime_log: Option<String>,
    pub duration_ms: i64,
    pub completed_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DashboardStats {
    pub total_incidents: i64,
    pub high_severity_incidents: i64,
    pub open_incidents: i64,
    pub workflows_monitored: i64,
    pub safe_sandbox_runs: i64,
    pub total_sandbox_runs: i64,
}

// Request and response bodies

#[derive(Deserialize, Debug)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user: UserResponse,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct AppStatusResponse {
    pub installed: bool,
    pub installation_id: Option<i64>,
    pub token_expires_at: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Deserialize, Debug)]
pub struct CreateRepositoryRequest {
    pub full_name: String,
}

#[derive(Deserialize, Debug)]
pub struct CreateIncidentRequest {
    pub pr_number: Option<i64>,
    pub workflow_path: String,
    pub severity: Severity,
    pub finding_type: String,
    pub description: String,
}

#[derive(Deserialize, Debug)]
pub struct UpdateStatusRequest {
    pub status: IncidentStatus,
}

/// Body of `POST /sandbox/{incident_id}`
///
/// `verdict` is accepted for compatibility with clients that send the
/// placeholder `"Unknown"`; the gateway always assigns the verdict itself.
#[derive(Deserialize, Debug)]
pub struct SandboxRequest {
    pub snippet_executed: String,
    pub verdict: Option<String>,
    pub language: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}
