use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vectorset::api::router;
use vectorset::config::Config;
use vectorset::engine::Engine;

fn app() -> axum::Router {
    let config = Config::default();
    let engine = Engine::new(config.clone(), CancellationToken::new()).unwrap();
    router(engine, config)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check_contract() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_error_schema_contract() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/command")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({"args": ["VDIM", "missing"]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    // Contract: errors come back as {"error": {"code": ..., "message": ...}}
    assert_eq!(body["error"]["code"], "command_error");
    assert_eq!(body["error"]["message"], "ERR key does not exist");
}

#[tokio::test]
async fn test_empty_args_rejected() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/command")
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"args": []}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_argument");
}

#[tokio::test]
async fn test_metrics_are_plain_text() {
    let app = app();
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/command")
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"args": ["PING"]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("vset_commands_total 1\n"));
}
