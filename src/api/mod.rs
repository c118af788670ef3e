pub mod errors;
pub mod routes_command;

use crate::config::Config;
use crate::engine::Engine;
use axum::{
    routing::{get, post},
    Router,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub config: Config,
}

pub fn router(engine: Engine, config: Config) -> Router {
    let state = AppState { engine, config };
    Router::new()
        .route("/health", get(routes_command::health))
        .route("/metrics", get(routes_command::metrics))
        .route("/v1/command", post(routes_command::command))
        .route("/v1/replication", get(routes_command::replication))
        .with_state(state)
}
