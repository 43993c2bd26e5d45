use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::Config;
use crate::queue::{IncidentLocks, RunQueue};
use crate::routes::{
    configure_api, health, json_error_handler, path_error_handler, query_error_handler,
};

/// Shared state handed to every HTTP worker
#[derive(Clone)]
pub struct AppState {
    pub config: web::Data<Config>,
    pub db_pool: web::Data<SqlitePool>,
    pub queue: web::Data<RunQueue>,
    pub locks: web::Data<IncidentLocks>,
}

impl AppState {
    pub fn new(config: Config, db_pool: Arc<SqlitePool>, queue: Arc<RunQueue>) -> Self {
        Self {
            config: web::Data::new(config),
            db_pool: web::Data::from(db_pool),
            queue: web::Data::from(queue),
            locks: web::Data::new(IncidentLocks::new()),
        }
    }
}

/// Registers state, extractor error handlers and all routes on an `App`
pub fn configure_app(state: AppState) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(state.config)
            .app_data(state.db_pool)
            .app_data(state.queue)
            .app_data(state.locks)
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .app_data(web::PathConfig::default().error_handler(path_error_handler))
            .service(health)
            .service(web::scope("/api").configure(configure_api));
    }
}

pub fn build_server(state: AppState) -> std::io::Result<Server> {
    let bind_address = state
        .config
        .server
        .bind_address
        .clone()
        .unwrap_or("127.0.0.1".to_string());
    let bind_port = state.config.server.bind_port.unwrap_or(8000);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .configure(configure_app(state.clone()))
    })
    .bind((bind_address, bind_port))?
    .run();

    Ok(server)
}
