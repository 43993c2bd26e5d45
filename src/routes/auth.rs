use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};

use super::*;
use crate::auth::{MIN_PASSWORD_CHARS, hash_password, hash_token, is_valid_email, new_token, verify_password};
use crate::config::Config;

#[post("/auth/signup")]
pub async fn signup_handler(
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    body: web::Json<SignupRequest>,
) -> GatewayResult<HttpResponse> {
    let email = body.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(GatewayError::InvalidInput(format!(
            "Invalid email address {email}"
        )));
    }
    if body.password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(GatewayError::InvalidInput(format!(
            "Password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }

    let password = body.password.clone();
    let cost = config.auth.bcrypt_cost;
    let password_hash = web::block(move || hash_password(&password, cost))
        .await
        .map_err(|e| anyhow!("password hashing task failed: {e}"))?
        .map_err(|e| anyhow!("password hashing failed: {e}"))?;

    match db::create_user(&email, &password_hash, pool.into_inner()).await {
        Ok(user) => {
            log::info!("Registered user {}", user.id);
            Ok(HttpResponse::Ok().json(UserResponse::from(user)))
        }
        Err(e) if db::is_unique_violation(&e) => Err(GatewayError::Conflict(
            "Email already registered".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

#[post("/auth/login")]
pub async fn login_handler(
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    body: web::Json<LoginRequest>,
) -> GatewayResult<HttpResponse> {
    let pool = pool.into_inner();
    let email = body.email.trim().to_lowercase();

    let user = db::fetch_user_by_email(&email, pool.clone()).await?;
    let verified = match &user {
        Some(user) => {
            let password = body.password.clone();
            let stored = user.password_hash.clone();
            web::block(move || verify_password(&password, &stored))
                .await
                .map_err(|e| anyhow!("password check task failed: {e}"))?
        }
        None => false,
    };

    let user = match user {
        Some(user) if verified => user,
        _ => {
            return Err(GatewayError::Unauthorized(
                "Invalid email or password".to_string(),
            ));
        }
    };

    let token = new_token();
    let expires_at = (Utc::now() + chrono::Duration::minutes(config.auth.token_ttl_minutes))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    db::create_session(&hash_token(&token), &user.id, &expires_at, pool).await?;
    log::info!("User {} logged in, session valid until {expires_at}", user.id);

    Ok(HttpResponse::Ok().json(LoginResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        user: user.into(),
    }))
}

#[get("/auth/user/{user_id}")]
pub async fn get_user_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
) -> GatewayResult<HttpResponse> {
    let user_id = path.into_inner();
    caller.ensure_is(&user_id)?;

    match db::fetch_user(&user_id, pool.into_inner()).await? {
        Some(user) => Ok(HttpResponse::Ok().json(UserResponse::from(user))),
        None => Err(GatewayError::NotFound(format!("User {user_id} not found"))),
    }
}

#[get("/auth/github/app-status/{user_id}")]
pub async fn app_status_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
) -> GatewayResult<HttpResponse> {
    let user_id = path.into_inner();
    caller.ensure_is(&user_id)?;

    let user = db::fetch_user(&user_id, pool.into_inner())
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("User {user_id} not found")))?;

    Ok(HttpResponse::Ok().json(AppStatusResponse {
        installed: user.github_installation_id.is_some(),
        installation_id: user.github_installation_id,
        token_expires_at: user.github_token_expires_at,
    }))
}

#[derive(Deserialize, Debug)]
pub struct InstallationCallbackQuery {
    pub installation_id: i64,
    pub setup_action: Option<String>,
    /// The id of the user who started the installation
    pub state: String,
}

/// Records the installation id GitHub hands back after the App is installed
#[get("/auth/github/callback")]
pub async fn github_callback_handler(
    caller: AuthenticatedUser,
    pool: web::Data<SqlitePool>,
    query: web::Query<InstallationCallbackQuery>,
) -> GatewayResult<HttpResponse> {
    caller.ensure_is(&query.state)?;

    if !db::set_installation(&query.state, query.installation_id, None, pool.into_inner()).await? {
        return Err(GatewayError::NotFound(format!(
            "User {} not found",
            query.state
        )));
    }
    log::info!(
        "User {} linked installation {} ({})",
        query.state,
        query.installation_id,
        query.setup_action.as_deref().unwrap_or("install")
    );

    Ok(HttpResponse::Ok().json(MessageResponse {
        message: "GitHub App installation recorded".to_string(),
    }))
}
