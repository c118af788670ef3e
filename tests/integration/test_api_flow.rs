use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt; // for `oneshot`
use vectorset::api::router;
use vectorset::config::Config;
use vectorset::engine::Engine;

async fn send(app: &Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/command")
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_api_vector_set_flow() {
    let dir = tempdir().unwrap();
    let config = Config {
        data_dir: Some(dir.path().to_str().unwrap().to_string()),
        ..Config::default()
    };
    let engine = Engine::new(config.clone(), CancellationToken::new()).unwrap();
    let app = router(engine.clone(), config);

    // 1. Add vectors, one as a binary FP32 blob
    let (status, body) = send(
        &app,
        json!({"args": ["VADD", "docs", "VALUES", "4", "1", "0", "0", "0", "doc:1"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply"], 1);

    let blob: Vec<u8> = [0.0f32, 1.0, 0.0, 0.0]
        .iter()
        .flat_map(|x| x.to_le_bytes())
        .collect();
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD.encode(blob);
    let (status, body) = send(
        &app,
        json!({"args": ["VADD", "docs", "FP32", {"b64": b64}, "doc:2", "CAS"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply"], 1);

    // 2. Cardinality
    let (_, body) = send(&app, json!({"args": ["VCARD", "docs"]})).await;
    assert_eq!(body["reply"], 2);

    // 3. Search with scores
    let (status, body) = send(
        &app,
        json!({"args": ["VSIM", "docs", "VALUES", "4", "0.1", "1", "0", "0", "WITHSCORES"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let scores = body["reply"].as_object().unwrap();
    assert!(scores["doc:2"].as_f64().unwrap() > scores["doc:1"].as_f64().unwrap());

    // 4. Info
    let (_, body) = send(&app, json!({"args": ["VINFO", "docs"]})).await;
    assert_eq!(body["reply"]["quant-type"], "int8");
    assert_eq!(body["reply"]["size"], 2);

    // 5. Replication feed carries both inserts
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/replication?since=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let feed: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(feed["last_offset"], 2);
    assert_eq!(feed["commands"][0]["args"][0], "VADD");

    // 6. Remove, then the key disappears with its last element
    let (_, body) = send(&app, json!({"args": ["VREM", "docs", "doc:1"]})).await;
    assert_eq!(body["reply"], 1);
    let (_, body) = send(&app, json!({"args": ["VREM", "docs", "doc:2"]})).await;
    assert_eq!(body["reply"], 1);
    let (_, body) = send(&app, json!({"args": ["EXISTS", "docs"]})).await;
    assert_eq!(body["reply"], 0);

    // 7. Save
    let (status, body) = send(&app, json!({"args": ["SAVE"]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply"], "OK");
    assert!(dir.path().join("dump.vset").exists());
}
