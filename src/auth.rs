//! Password hashing, session tokens and the bearer-token extractor

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;

use actix_web::dev::Payload;
use actix_web::http::header;
use actix_web::{FromRequest, HttpRequest, web};
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::database as db;
use crate::error::GatewayError;

pub const MIN_PASSWORD_CHARS: usize = 8;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // A constant pattern; covered by tests.
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap()
});

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hashes a password with bcrypt; slow by design of the algorithm, so call
/// it off the async executor
pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, cost)
}

/// Checks a password against a stored bcrypt hash; a malformed hash never matches
pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

/// A new opaque bearer token; only its hash is ever stored
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn hash_token(token: &str) -> String {
    sha256_hex(&[token])
}

/// The caller identified by a valid `Authorization: Bearer` header
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

impl AuthenticatedUser {
    /// Rejects requests that name a user other than the caller
    pub fn ensure_is(&self, user_id: &str) -> Result<(), GatewayError> {
        if self.user_id != user_id {
            return Err(GatewayError::Forbidden(
                "Not allowed to access another user's data".to_string(),
            ));
        }
        Ok(())
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return None;
    }
    Some(token.trim().to_string())
}

impl FromRequest for AuthenticatedUser {
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let token = bearer_token(req);
        let pool = req.app_data::<web::Data<SqlitePool>>().cloned();

        Box::pin(async move {
            let token = token.ok_or_else(|| {
                GatewayError::Unauthorized("Missing bearer token".to_string())
            })?;
            let pool = pool.ok_or_else(|| {
                GatewayError::Internal(anyhow::anyhow!("database pool not configured"))
            })?;

            match db::find_session_user(&hash_token(&token), pool.into_inner()).await? {
                Some(user_id) => Ok(Self { user_id }),
                None => Err(GatewayError::Unauthorized(
                    "Invalid or expired token".to_string(),
                )),
            }
        })
    }
}
