use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::database as db;
use crate::models::SandboxRun;
use crate::queue::{RunMessage, RunQueue};
use crate::sandbox::policy::{scan_artifacts, scan_snippet};
use crate::sandbox::{
    ExecutionArtifacts, ExecutionOutcome, RunState, SandboxRunner, create_sandbox_runner,
};
use crate::validator::ValidatedSubmission;
use crate::verdict::{classify, render_runtime_log};

pub async fn worker(
    id: u8,
    sandbox_config: Arc<SandboxConfig>,
    db_pool: Arc<SqlitePool>,
    queue: Arc<RunQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let sandbox: Arc<dyn SandboxRunner> = Arc::from(create_sandbox_runner(id, &sandbox_config)?);
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            message = queue.pop() => {
                handle_message(id, message, &sandbox, &sandbox_config, db_pool.clone()).await;
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

async fn handle_message(
    id: u8,
    message: RunMessage,
    sandbox: &Arc<dyn SandboxRunner>,
    sandbox_config: &SandboxConfig,
    db_pool: Arc<SqlitePool>,
) {
    let RunMessage {
        run_id,
        submission,
        responder,
        guard,
    } = message;

    // Nobody is waiting any more and nothing has started yet.
    if responder.is_closed() {
        log::warn!(
            "Run {run_id} for incident {} abandoned by client before execution, skipped",
            submission.incident_id
        );
        return;
    }

    log::info!(
        "Worker {id} got run {run_id} for incident {} ({} bytes, sha256 {})",
        submission.incident_id,
        submission.snippet.len(),
        snippet_digest(&submission.snippet)
    );

    let result = execute_run(run_id.clone(), submission, sandbox.clone(), sandbox_config, db_pool).await;
    if let Err(e) = &result {
        log::error!("Run {run_id} failed on worker {id}: {e:#}");
    }

    // The run is committed (or failed), so the next submission may proceed.
    drop(guard);

    if responder.send(result).is_err() {
        log::warn!("Client of run {run_id} disconnected, result kept in store only");
    } else {
        log::debug!("Run {run_id} result sent back from worker {id}");
    }
}

/// Executes, classifies and commits one submission
///
/// Only a terminal run is ever written. An `Err` is an infrastructure fault
/// (spawn failure, store unavailable); snippet failures are data in the run.
pub async fn execute_run(
    run_id: String,
    submission: ValidatedSubmission,
    sandbox: Arc<dyn SandboxRunner>,
    sandbox_config: &SandboxConfig,
    db_pool: Arc<SqlitePool>,
) -> anyhow::Result<SandboxRun> {
    let static_signals = scan_snippet(&submission.snippet);

    let state = RunState::Pending.advance(RunState::Running)?;
    log::debug!("Run {run_id} is {}", state.as_str());

    let artifacts = if !static_signals.is_empty() && !sandbox.enforces_cgroup_limits() {
        log::warn!(
            "Run {run_id} not executed: {} policy signal(s) and no cgroup limits available",
            static_signals.len()
        );
        refused_artifacts()
    } else {
        let sandbox_ref = Arc::clone(&sandbox);
        let snippet = submission.snippet.clone();
        let language = submission.language.clone();
        tokio::task::spawn_blocking(move || sandbox_ref.execute(&snippet, &language))
            .await
            .map_err(|e| anyhow!("sandbox task failed: {e}"))??
    };

    let state = state.advance(artifacts.outcome.state())?;
    log::debug!("Run {run_id} is {}", state.as_str());

    let mut signals = static_signals;
    signals.extend(scan_artifacts(&artifacts));

    let classification = classify(&artifacts, &signals, sandbox_config.inconclusive_verdict);
    let runtime_log = render_runtime_log(&artifacts, &signals, &classification);

    let run = SandboxRun {
        id: run_id,
        incident_id: submission.incident_id,
        snippet_executed: submission.snippet,
        language: submission.language.name,
        verdict: classification.verdict,
        outcome: state,
        policy_signals: Json(signals),
        runtime_log: Some(runtime_log),
        duration_ms: artifacts.wall_time.as_millis() as i64,
        completed_at: Some(crate::create_timestamp()),
    };

    db::save_run(&run, db_pool).await?;
    log::info!(
        "Run {} for incident {} committed: {} ({})",
        run.id,
        run.incident_id,
        run.verdict,
        classification.reason
    );

    Ok(run)
}

/// Stand-in artifacts for a snippet that was flagged and never started
fn refused_artifacts() -> ExecutionArtifacts {
    ExecutionArtifacts {
        outcome: ExecutionOutcome::Crashed {
            reason: "not executed: policy violation detected and runner has no cgroup limits"
                .to_string(),
        },
        stdout: String::new(),
        stderr: String::new(),
        wall_time: Duration::ZERO,
        memory_kb: None,
        signal: None,
    }
}

fn snippet_digest(snippet: &str) -> String {
    let digest = hex::encode(Sha256::digest(snippet.as_bytes()));
    digest[..12].to_string()
}
