#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use guardian::auth::{hash_password, hash_token, new_token};
use guardian::config::Config;
use guardian::database as db;
use guardian::models::{CreateIncidentRequest, Incident, Repository, Severity};
use guardian::queue::RunQueue;
use guardian::web_server::AppState;
use guardian::worker::worker;

/// A database, a queue and live sandbox workers for one test
///
/// Workers are stopped and the database removed on drop.
pub struct TestContext {
    pub state: AppState,
    pub pool: Arc<SqlitePool>,
    token: CancellationToken,
    db_path: PathBuf,
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.token.cancel();

        let db_path = self.db_path.display().to_string();
        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(format!("{db_path}-wal"));
        let _ = fs::remove_file(format!("{db_path}-shm"));
    }
}

/// Config with the plain-process runner and `/bin/sh` and `/bin/bash` as languages
///
/// Unconfined runs are allowed so the suite also passes on hosts without
/// unprivileged user namespaces; tests of confinement check
/// `confinement_available` first.
pub fn test_config(sandbox_overrides: serde_json::Value) -> Config {
    let mut sandbox = json!({
        "runner": "simple",
        "max_snippet_bytes": 256,
        "time_limit": 3_000_000,
        "output_limit": 4096,
        "allow_unconfined": true,
    });
    if let (Some(base), Some(extra)) = (sandbox.as_object_mut(), sandbox_overrides.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }

    let config: Config = serde_json::from_value(json!({
        "server": {},
        "sandbox": sandbox,
        "languages": [
            {"name": "shell", "file_name": "snippet.sh", "command": ["/bin/sh", "%INPUT%"]},
            {"name": "bash", "file_name": "snippet.bash", "command": ["/bin/bash", "%INPUT%"]}
        ],
        "auth": {"bcrypt_cost": 4}
    }))
    .unwrap();
    config.check().unwrap();
    config
}

pub async fn setup(sandbox_overrides: serde_json::Value, workers: u8) -> TestContext {
    let config = test_config(sandbox_overrides);
    let db_path = std::env::temp_dir().join(format!("guardian-test-{}.sqlite3", guardian::create_id()));
    let pool = Arc::new(db::init_db(&db_path).await.unwrap());
    let queue = Arc::new(RunQueue::new());
    let token = CancellationToken::new();

    let sandbox_config = Arc::new(config.sandbox.clone());
    for i in 1..=workers {
        tokio::spawn(worker(
            i,
            sandbox_config.clone(),
            pool.clone(),
            queue.clone(),
            token.clone(),
        ));
    }

    TestContext {
        state: AppState::new(config, pool.clone(), queue),
        pool,
        token,
        db_path,
    }
}

/// Creates a user with a live session and returns `(user_id, bearer token)`
pub async fn seed_user(ctx: &TestContext, email: &str) -> (String, String) {
    let user = db::create_user(email, &hash_password("password123", 4).unwrap(), ctx.pool.clone())
        .await
        .unwrap();
    let token = new_token();
    db::create_session(
        &hash_token(&token),
        &user.id,
        "2999-01-01T00:00:00.000Z",
        ctx.pool.clone(),
    )
    .await
    .unwrap();
    (user.id, token)
}

pub async fn seed_incident(ctx: &TestContext, user_id: &str) -> (Repository, Incident) {
    let repo = db::create_repository(user_id, "octo/pipelines", ctx.pool.clone())
        .await
        .unwrap();
    let incident = db::create_incident(
        &repo.id,
        &CreateIncidentRequest {
            pr_number: Some(42),
            workflow_path: ".github/workflows/release.yml".to_string(),
            severity: Severity::High,
            finding_type: "script-injection".to_string(),
            description: "github.event.issue.title used in run step".to_string(),
        },
        ctx.pool.clone(),
    )
    .await
    .unwrap();
    (repo, incident)
}

pub fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}
