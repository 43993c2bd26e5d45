use std::sync::LazyLock;

use regex::Regex;

use super::*;

static FULL_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // A constant pattern; covered by tests.
    Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").unwrap()
});

fn check_full_name(full_name: &str) -> GatewayResult<&str> {
    let full_name = full_name.trim();
    if !FULL_NAME_PATTERN.is_match(full_name) {
        return Err(GatewayError::InvalidInput(format!(
            "Repository name must look like owner/name, got \"{full_name}\""
        )));
    }
    Ok(full_name)
}

#[get("/repos")]
pub async fn list_repos_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    query: web::Query<UserQuery>,
) -> GatewayResult<HttpResponse> {
    caller.ensure_is(&query.user_id)?;
    let repos = db::list_repositories(&query.user_id, pool.into_inner()).await?;
    log::info!("Got {} repositories for user {}", repos.len(), query.user_id);
    Ok(HttpResponse::Ok().json(repos))
}

#[post("/repos")]
pub async fn create_repo_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    query: web::Query<UserQuery>,
    body: web::Json<CreateRepositoryRequest>,
) -> GatewayResult<HttpResponse> {
    caller.ensure_is(&query.user_id)?;
    let full_name = check_full_name(&body.full_name)?;

    match db::create_repository(&query.user_id, full_name, pool.into_inner()).await {
        Ok(repo) => {
            log::info!("User {} now tracks {}", repo.user_id, repo.full_name);
            Ok(HttpResponse::Ok().json(repo))
        }
        Err(e) if db::is_unique_violation(&e) => Err(GatewayError::Conflict(format!(
            "Repository {full_name} is already tracked"
        ))),
        Err(e) => Err(e.into()),
    }
}

#[get("/repos/{repo_id}")]
pub async fn get_repo_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
) -> GatewayResult<HttpResponse> {
    let repo = owned_repository(&path.into_inner(), &caller, pool.into_inner()).await?;
    Ok(HttpResponse::Ok().json(repo))
}

#[delete("/repos/{repo_id}")]
pub async fn delete_repo_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
) -> GatewayResult<HttpResponse> {
    let pool = pool.into_inner();
    let repo = owned_repository(&path.into_inner(), &caller, pool.clone()).await?;

    if !db::delete_repository(&repo.id, pool).await? {
        return Err(GatewayError::NotFound(format!(
            "Repository {} not found",
            repo.id
        )));
    }
    log::info!("User {} untracked {}", repo.user_id, repo.full_name);

    Ok(HttpResponse::Ok().json(MessageResponse {
        message: "Repository deleted successfully".to_string(),
    }))
}
