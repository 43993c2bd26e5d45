pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod validator;
pub mod verdict;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn create_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
