use anyhow::anyhow;
use tokio::sync::oneshot;

use super::*;
use crate::config::Config;
use crate::queue::{IncidentLocks, RunMessage, RunQueue};
use crate::validator::validate_submission;

#[get("/sandbox/{incident_id}")]
pub async fn get_sandbox_run_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
) -> GatewayResult<HttpResponse> {
    let incident_id = path.into_inner();
    let pool = pool.into_inner();

    owned_incident(&incident_id, &caller, pool.clone()).await?;

    match db::fetch_run(&incident_id, pool).await? {
        Some(run) => Ok(HttpResponse::Ok().json(run)),
        None => Err(GatewayError::NotFound(format!(
            "No sandbox run for incident {incident_id}"
        ))),
    }
}

/// Runs a snippet for an incident and answers with the finished run
///
/// The request stays open for the whole execution, which the sandbox time
/// limit bounds. Submissions for the same incident are executed one at a time.
#[post("/sandbox/{incident_id}")]
pub async fn post_sandbox_run_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    queue: web::Data<RunQueue>,
    locks: web::Data<IncidentLocks>,
    path: web::Path<String>,
    body: web::Json<SandboxRequest>,
) -> GatewayResult<HttpResponse> {
    let incident_id = path.into_inner();
    let submission =
        validate_submission(&incident_id, &body, &config, &caller, pool.into_inner()).await?;

    let guard = locks.acquire(&incident_id).await;
    let run_id = crate::create_id();
    let (tx, rx) = oneshot::channel();
    queue
        .push(RunMessage {
            run_id: run_id.clone(),
            submission,
            responder: tx,
            guard,
        })
        .await;
    log::debug!("Queued run {run_id} for incident {incident_id}");

    match rx.await {
        Ok(Ok(run)) => {
            log::info!("Run {run_id} for incident {incident_id} returned {}", run.verdict);
            Ok(HttpResponse::Ok().json(run))
        }
        Ok(Err(e)) => Err(GatewayError::Internal(e)),
        Err(e) => Err(GatewayError::Internal(anyhow!(
            "worker dropped run {run_id}: {e}"
        ))),
    }
}
