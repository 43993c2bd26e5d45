use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::models::{
    CreateIncidentRequest, DashboardStats, Incident, IncidentStatus, Repository, SandboxRun, User,
};
use crate::{create_id, create_timestamp};

const DATABASE_NAME: &str = "guardian.sqlite3";

pub fn get_db_path() -> std::io::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "guardian").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "Unable to find user directory")
    })?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Per-connection settings, so every pooled connection enforces cascades.
                for pragma_sql in &["PRAGMA foreign_keys = ON;", "PRAGMA busy_timeout = 2000;"] {
                    sqlx::query(pragma_sql).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(&db_url)
        .await?;

    // Database-wide settings (cannot be run inside a transaction)
    for pragma_sql in &[
        "PRAGMA journal_mode = WAL;",   // Write-Ahead Logging for better concurrency
        "PRAGMA synchronous = NORMAL;", // Balance between safety and performance
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS users (
            id                       TEXT PRIMARY KEY,
            email                    TEXT NOT NULL UNIQUE,
            password_hash            TEXT NOT NULL,
            github_installation_id   INTEGER,
            github_token_expires_at  TEXT,
            created_at               TEXT NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS sessions (
            token_hash  TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
        );",
        r"
        CREATE TABLE IF NOT EXISTS repositories (
            id          TEXT    PRIMARY KEY,
            user_id     TEXT    NOT NULL,
            full_name   TEXT    NOT NULL,
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL,
            UNIQUE (user_id, full_name),
            FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
        );",
        r"
        CREATE TABLE IF NOT EXISTS incidents (
            id             TEXT    PRIMARY KEY,
            repo_id        TEXT    NOT NULL,
            pr_number      INTEGER,
            workflow_path  TEXT    NOT NULL,
            severity       TEXT    NOT NULL,
            finding_type   TEXT    NOT NULL,
            description    TEXT    NOT NULL,
            status         TEXT    NOT NULL,
            created_at     TEXT    NOT NULL,
            FOREIGN KEY (repo_id) REFERENCES repositories (id) ON DELETE CASCADE
        );",
        "CREATE INDEX IF NOT EXISTS idx_incidents_repo ON incidents(repo_id);",
        r"
        CREATE TABLE IF NOT EXISTS sandbox_runs (
            id                TEXT    PRIMARY KEY,
            incident_id       TEXT    NOT NULL UNIQUE,
            snippet_executed  TEXT    NOT NULL,
            language          TEXT    NOT NULL,
            verdict           TEXT    NOT NULL,
            outcome           TEXT    NOT NULL,
            policy_signals    TEXT    NOT NULL,
            runtime_log       TEXT,
            duration_ms       INTEGER NOT NULL,
            completed_at      TEXT,
            FOREIGN KEY (incident_id) REFERENCES incidents (id) ON DELETE CASCADE
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Whether a failed statement broke a UNIQUE constraint
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

// ---------- users and sessions ----------

pub async fn create_user(
    email: &str,
    password_hash: &str,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<User> {
    let user = User {
        id: create_id(),
        email: email.to_string(),
        password_hash: password_hash.to_string(),
        github_installation_id: None,
        github_token_expires_at: None,
        created_at: create_timestamp(),
    };

    sqlx::query(
        r"
        INSERT INTO users (id, email, password_hash, created_at)
        VALUES (?, ?, ?, ?)
        ",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(&user.created_at)
    .execute(pool.as_ref())
    .await?;

    Ok(user)
}

pub async fn fetch_user(id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.as_ref())
        .await
}

pub async fn fetch_user_by_email(email: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool.as_ref())
        .await
}

/// Records the GitHub App installation reported by the external integration
pub async fn set_installation(
    user_id: &str,
    installation_id: i64,
    token_expires_at: Option<&str>,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE users
        SET github_installation_id = ?, github_token_expires_at = ?
        WHERE id = ?
        ",
    )
    .bind(installation_id)
    .bind(token_expires_at)
    .bind(user_id)
    .execute(pool.as_ref())
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn create_session(
    token_hash: &str,
    user_id: &str,
    expires_at: &str,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    // Expired sessions are dropped opportunistically on every login.
    sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(create_timestamp())
        .execute(tx.as_mut())
        .await?;

    sqlx::query("INSERT INTO sessions (token_hash, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(token_hash)
        .bind(user_id)
        .bind(expires_at)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Returns the owner of an unexpired session
pub async fn find_session_user(
    token_hash: &str,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT user_id FROM sessions WHERE token_hash = ? AND expires_at > ?",
    )
    .bind(token_hash)
    .bind(create_timestamp())
    .fetch_optional(pool.as_ref())
    .await
}

// ---------- repositories ----------

pub async fn create_repository(
    user_id: &str,
    full_name: &str,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Repository> {
    let repo = Repository {
        id: create_id(),
        user_id: user_id.to_string(),
        full_name: full_name.to_string(),
        is_active: true,
        created_at: create_timestamp(),
    };

    sqlx::query(
        r"
        INSERT INTO repositories (id, user_id, full_name, is_active, created_at)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(&repo.id)
    .bind(&repo.user_id)
    .bind(&repo.full_name)
    .bind(repo.is_active)
    .bind(&repo.created_at)
    .execute(pool.as_ref())
    .await?;

    Ok(repo)
}

pub async fn list_repositories(user_id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Vec<Repository>> {
    sqlx::query_as::<_, Repository>(
        "SELECT * FROM repositories WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
    )
    .bind(user_id)
    .fetch_all(pool.as_ref())
    .await
}

pub async fn fetch_repository(id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Option<Repository>> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.as_ref())
        .await
}

/// Deletes a repository together with its incidents and their runs
pub async fn delete_repository(id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
        .bind(id)
        .execute(pool.as_ref())
        .await?;

    Ok(result.rows_affected() > 0)
}

// ---------- incidents ----------

pub async fn create_incident(
    repo_id: &str,
    body: &CreateIncidentRequest,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Incident> {
    let incident = Incident {
        id: create_id(),
        repo_id: repo_id.to_string(),
        pr_number: body.pr_number,
        workflow_path: body.workflow_path.clone(),
        severity: body.severity,
        finding_type: body.finding_type.clone(),
        description: body.description.clone(),
        status: IncidentStatus::Open,
        created_at: create_timestamp(),
    };

    sqlx::query(
        r"
        INSERT INTO incidents (id, repo_id, pr_number, workflow_path, severity, finding_type, description, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&incident.id)
    .bind(&incident.repo_id)
    .bind(incident.pr_number)
    .bind(&incident.workflow_path)
    .bind(incident.severity)
    .bind(&incident.finding_type)
    .bind(&incident.description)
    .bind(incident.status)
    .bind(&incident.created_at)
    .execute(pool.as_ref())
    .await?;

    Ok(incident)
}

/// All incidents on the user's repositories, newest first
pub async fn list_incidents(user_id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Vec<Incident>> {
    sqlx::query_as::<_, Incident>(
        r"
        SELECT i.* FROM incidents i
        JOIN repositories r ON r.id = i.repo_id
        WHERE r.user_id = ?
        ORDER BY i.created_at DESC, i.rowid DESC
        ",
    )
    .bind(user_id)
    .fetch_all(pool.as_ref())
    .await
}

pub async fn fetch_incident(id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Option<Incident>> {
    sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.as_ref())
        .await
}

/// Returns the id of the user owning the incident's repository
pub async fn incident_owner(incident_id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        r"
        SELECT r.user_id FROM incidents i
        JOIN repositories r ON r.id = i.repo_id
        WHERE i.id = ?
        ",
    )
    .bind(incident_id)
    .fetch_optional(pool.as_ref())
    .await
}

pub async fn update_incident_status(
    id: &str,
    status: IncidentStatus,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Option<Incident>> {
    let result = sqlx::query("UPDATE incidents SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool.as_ref())
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    fetch_incident(id, pool).await
}

pub async fn dashboard_stats(user_id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<DashboardStats> {
    let (total_incidents, high_severity_incidents, open_incidents, workflows_monitored) =
        sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r"
            SELECT
                COUNT(*),
                COALESCE(SUM(i.severity = 'High'), 0),
                COALESCE(SUM(i.status = 'Open'), 0),
                COUNT(DISTINCT i.workflow_path)
            FROM incidents i
            JOIN repositories r ON r.id = i.repo_id
            WHERE r.user_id = ?
            ",
        )
        .bind(user_id)
        .fetch_one(pool.as_ref())
        .await?;

    let (total_sandbox_runs, safe_sandbox_runs) = sqlx::query_as::<_, (i64, i64)>(
        r"
        SELECT COUNT(*), COALESCE(SUM(s.verdict = 'Safe'), 0)
        FROM sandbox_runs s
        JOIN incidents i ON i.id = s.incident_id
        JOIN repositories r ON r.id = i.repo_id
        WHERE r.user_id = ?
        ",
    )
    .bind(user_id)
    .fetch_one(pool.as_ref())
    .await?;

    Ok(DashboardStats {
        total_incidents,
        high_severity_incidents,
        open_incidents,
        workflows_monitored,
        safe_sandbox_runs,
        total_sandbox_runs,
    })
}

// ---------- sandbox runs ----------

/// Stores a terminal run, replacing any earlier run of the same incident
pub async fn save_run(run: &SandboxRun, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO sandbox_runs
            (id, incident_id, snippet_executed, language, verdict, outcome, policy_signals, runtime_log, duration_ms, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (incident_id) DO UPDATE SET
            id = excluded.id,
            snippet_executed = excluded.snippet_executed,
            language = excluded.language,
            verdict = excluded.verdict,
            outcome = excluded.outcome,
            policy_signals = excluded.policy_signals,
            runtime_log = excluded.runtime_log,
            duration_ms = excluded.duration_ms,
            completed_at = excluded.completed_at
        ",
    )
    .bind(&run.id)
    .bind(&run.incident_id)
    .bind(&run.snippet_executed)
    .bind(&run.language)
    .bind(run.verdict)
    .bind(run.outcome)
    .bind(&run.policy_signals)
    .bind(&run.runtime_log)
    .bind(run.duration_ms)
    .bind(&run.completed_at)
    .execute(pool.as_ref())
    .await?;

    Ok(())
}

pub async fn fetch_run(incident_id: &str, pool: Arc<SqlitePool>) -> sqlx::Result<Option<SandboxRun>> {
    sqlx::query_as::<_, SandboxRun>("SELECT * FROM sandbox_runs WHERE incident_id = ?")
        .bind(incident_id)
        .fetch_optional(pool.as_ref())
        .await
}

#[cfg(test)]
mod tests {
    use sqlx::types::Json;

    use super::*;
    use crate::models::Severity;
    use crate::sandbox::RunState;
    use crate::verdict::Verdict;

    async fn test_pool(name: &str) -> Arc<SqlitePool> {
        let path = std::env::temp_dir().join(format!("guardian-db-{name}-{}.sqlite3", create_id()));
        Arc::new(init_db(&path).await.unwrap())
    }

    async fn seed_incident(pool: Arc<SqlitePool>) -> (User, Repository, Incident) {
        let user = create_user("dev@example.com", "salt$hash", pool.clone()).await.unwrap();
        let repo = create_repository(&user.id, "octo/ci", pool.clone()).await.unwrap();
        let incident = create_incident(
            &repo.id,
            &CreateIncidentRequest {
                pr_number: Some(7),
                workflow_path: ".github/workflows/ci.yml".to_string(),
                severity: Severity::High,
                finding_type: "script-injection".to_string(),
                description: "untrusted input in run step".to_string(),
            },
            pool.clone(),
        )
        .await
        .unwrap();
        (user, repo, incident)
    }

    fn run_for(incident_id: &str, verdict: Verdict) -> SandboxRun {
        SandboxRun {
            id: create_id(),
            incident_id: incident_id.to_string(),
            snippet_executed: "echo ok\n".to_string(),
            language: "shell".to_string(),
            verdict,
            outcome: RunState::Completed,
            policy_signals: Json(Vec::new()),
            runtime_log: Some("outcome: Completed (exit code 0)\n".to_string()),
            duration_ms: 4,
            completed_at: Some(create_timestamp()),
        }
    }

    #[tokio::test]
    async fn save_run_replaces_previous_run() {
        let pool = test_pool("replace").await;
        let (_, _, incident) = seed_incident(pool.clone()).await;

        let first = run_for(&incident.id, Verdict::Unknown);
        save_run(&first, pool.clone()).await.unwrap();
        let second = run_for(&incident.id, Verdict::Safe);
        save_run(&second, pool.clone()).await.unwrap();

        let stored = fetch_run(&incident.id, pool.clone()).await.unwrap().unwrap();
        assert_eq!(stored.id, second.id);
        assert_eq!(stored.verdict, Verdict::Safe);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sandbox_runs")
            .fetch_one(pool.as_ref())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn deleting_repository_cascades() {
        let pool = test_pool("cascade").await;
        let (_, repo, incident) = seed_incident(pool.clone()).await;
        save_run(&run_for(&incident.id, Verdict::Safe), pool.clone()).await.unwrap();

        assert!(delete_repository(&repo.id, pool.clone()).await.unwrap());
        assert!(fetch_incident(&incident.id, pool.clone()).await.unwrap().is_none());
        assert!(fetch_run(&incident.id, pool.clone()).await.unwrap().is_none());
        assert!(!delete_repository(&repo.id, pool).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_is_a_unique_violation() {
        let pool = test_pool("unique").await;
        create_user("a@example.com", "x", pool.clone()).await.unwrap();
        let err = create_user("a@example.com", "y", pool).await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn dashboard_counts_per_user() {
        let pool = test_pool("dashboard").await;
        let (user, _, incident) = seed_incident(pool.clone()).await;
        save_run(&run_for(&incident.id, Verdict::Safe), pool.clone()).await.unwrap();
        update_incident_status(&incident.id, IncidentStatus::Fixed, pool.clone())
            .await
            .unwrap();

        let stats = dashboard_stats(&user.id, pool.clone()).await.unwrap();
        assert_eq!(
            stats,
            DashboardStats {
                total_incidents: 1,
                high_severity_incidents: 1,
                open_incidents: 0,
                workflows_monitored: 1,
                safe_sandbox_runs: 1,
                total_sandbox_runs: 1,
            }
        );

        let empty = dashboard_stats("someone-else", pool).await.unwrap();
        assert_eq!(empty, DashboardStats::default());
    }

    #[tokio::test]
    async fn sessions_expire() {
        let pool = test_pool("sessions").await;
        let user = create_user("s@example.com", "x", pool.clone()).await.unwrap();
        create_session("live", &user.id, "2999-01-01T00:00:00.000Z", pool.clone())
            .await
            .unwrap();
        create_session("dead", &user.id, "2000-01-01T00:00:00.000Z", pool.clone())
            .await
            .unwrap();

        assert_eq!(
            find_session_user("live", pool.clone()).await.unwrap(),
            Some(user.id)
        );
        assert_eq!(find_session_user("dead", pool).await.unwrap(), None);
    }
}
