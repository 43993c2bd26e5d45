mod auth;
mod incidents;
mod repos;
mod sandbox;

pub use auth::{app_status_handler, get_user_handler, github_callback_handler, login_handler, signup_handler};
pub use incidents::{
    create_incident_handler, dashboard_handler, get_incident_handler, list_incidents_handler,
    update_incident_status_handler,
};
pub use repos::{create_repo_handler, delete_repo_handler, get_repo_handler, list_repos_handler};
pub use sandbox::{get_sandbox_run_handler, post_sandbox_run_handler};

use std::sync::Arc;

use actix_web::error::{InternalError, JsonPayloadError, PathError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, delete, get, post, put, web};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use crate::auth::AuthenticatedUser;
use crate::database as db;
use crate::error::{GatewayError, GatewayResult};
use crate::models::*;

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub detail: String,
}

fn bad_request(detail: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse { detail })
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("Invalid request body: {err}"));
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("Invalid query parameters: {err}"));
    InternalError::from_response(err, response).into()
}

pub fn path_error_handler(err: PathError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("Invalid path: {err}"));
    InternalError::from_response(err, response).into()
}

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "GitHub Guardian API",
    }))
}

/// Registers every `/api` route; mount inside `web::scope("/api")`
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(signup_handler)
        .service(login_handler)
        .service(get_user_handler)
        .service(app_status_handler)
        .service(github_callback_handler)
        .service(list_repos_handler)
        .service(create_repo_handler)
        .service(get_repo_handler)
        .service(delete_repo_handler)
        // `/incidents/dashboard` must precede `/incidents/{incident_id}`
        .service(dashboard_handler)
        .service(list_incidents_handler)
        .service(create_incident_handler)
        .service(get_incident_handler)
        .service(update_incident_status_handler)
        .service(get_sandbox_run_handler)
        .service(post_sandbox_run_handler);
}

/// Looks up an incident the caller owns; others' incidents do not exist
async fn owned_incident(
    incident_id: &str,
    caller: &AuthenticatedUser,
    pool: Arc<SqlitePool>,
) -> GatewayResult<Incident> {
    let not_found = || GatewayError::NotFound(format!("Incident {incident_id} not found"));

    match db::incident_owner(incident_id, pool.clone()).await? {
        Some(owner) if owner == caller.user_id => {
            db::fetch_incident(incident_id, pool).await?.ok_or_else(not_found)
        }
        _ => Err(not_found()),
    }
}

/// Looks up a repository the caller owns; others' repositories do not exist
async fn owned_repository(
    repo_id: &str,
    caller: &AuthenticatedUser,
    pool: Arc<SqlitePool>,
) -> GatewayResult<Repository> {
    match db::fetch_repository(repo_id, pool).await? {
        Some(repo) if repo.user_id == caller.user_id => Ok(repo),
        _ => Err(GatewayError::NotFound(format!(
            "Repository {repo_id} not found"
        ))),
    }
}
