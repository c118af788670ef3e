use crate::api::errors::ApiError;
use crate::api::AppState;
use crate::engine::{Args, CommandContext, Reply};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// A command argument: plain text, or binary data as `{"b64": "..."}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Text(String),
    Blob { b64: String },
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub args: Vec<Arg>,
    #[serde(default)]
    pub context: CommandContext,
}

fn decode_args(raw: Vec<Arg>) -> Result<Args, ApiError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, arg)| match arg {
            Arg::Text(text) => Ok(text.into_bytes()),
            Arg::Blob { b64 } => base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|_| ApiError::bad_request(format!("argument {i} is not valid base64"))),
        })
        .collect()
}

pub async fn command(
    State(state): State<AppState>,
    Json(payload): Json<CommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let args = decode_args(payload.args)?;
    if args.is_empty() {
        return Err(ApiError::bad_request("args must not be empty"));
    }
    let limit = Duration::from_secs(state.config.request_timeout_secs);
    let reply = tokio::time::timeout(limit, state.engine.execute(args, payload.context))
        .await
        .map_err(|_| {
            tracing::warn!(timeout_secs = limit.as_secs(), "command timed out");
            ApiError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", "command timed out")
        })?;

    match reply {
        Reply::Error(message) => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "command_error",
            message,
        )),
        other => Ok((StatusCode::OK, Json(json!({ "reply": other.to_json() })))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplicationQuery {
    #[serde(default)]
    pub since: u64,
}

pub async fn replication(
    State(state): State<AppState>,
    Query(query): Query<ReplicationQuery>,
) -> impl IntoResponse {
    let log = state.engine.replication();
    Json(json!({
        "last_offset": log.last_offset(),
        "commands": log.since(query.since),
    }))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": state.engine.health() }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.engine.metrics_text(),
    )
}
