use super::*;

#[get("/incidents")]
pub async fn list_incidents_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    query: web::Query<UserQuery>,
) -> GatewayResult<HttpResponse> {
    caller.ensure_is(&query.user_id)?;
    let incidents = db::list_incidents(&query.user_id, pool.into_inner()).await?;
    log::info!("Got {} incidents for user {}", incidents.len(), query.user_id);
    Ok(HttpResponse::Ok().json(incidents))
}

#[get("/incidents/dashboard")]
pub async fn dashboard_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    query: web::Query<UserQuery>,
) -> GatewayResult<HttpResponse> {
    caller.ensure_is(&query.user_id)?;
    let stats = db::dashboard_stats(&query.user_id, pool.into_inner()).await?;
    Ok(HttpResponse::Ok().json(stats))
}

/// Records a finding on a tracked repository
#[post("/incidents/{repo_id}")]
pub async fn create_incident_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    body: web::Json<CreateIncidentRequest>,
) -> GatewayResult<HttpResponse> {
    let pool = pool.into_inner();
    let repo = owned_repository(&path.into_inner(), &caller, pool.clone()).await?;

    if body.workflow_path.trim().is_empty() || body.finding_type.trim().is_empty() {
        return Err(GatewayError::InvalidInput(
            "workflow_path and finding_type must not be empty".to_string(),
        ));
    }

    let incident = db::create_incident(&repo.id, &body, pool).await?;
    log::info!(
        "Incident {} ({:?}) recorded for {}",
        incident.id,
        incident.severity,
        repo.full_name
    );
    Ok(HttpResponse::Ok().json(incident))
}

#[get("/incidents/{incident_id}")]
pub async fn get_incident_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
) -> GatewayResult<HttpResponse> {
    let incident = owned_incident(&path.into_inner(), &caller, pool.into_inner()).await?;
    Ok(HttpResponse::Ok().json(incident))
}

#[put("/incidents/{incident_id}/status")]
pub async fn update_incident_status_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    body: web::Json<UpdateStatusRequest>,
) -> GatewayResult<HttpResponse> {
    let pool = pool.into_inner();
    let incident = owned_incident(&path.into_inner(), &caller, pool.clone()).await?;

    match db::update_incident_status(&incident.id, body.status, pool).await? {
        Some(updated) => {
            log::info!(
                "Incident {} moved from {} to {}",
                updated.id,
                incident.status,
                updated.status
            );
            Ok(HttpResponse::Ok().json(updated))
        }
        None => Err(GatewayError::NotFound(format!(
            "Incident {} not found",
            incident.id
        ))),
    }
}
