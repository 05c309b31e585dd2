//! Router-level contract tests for `POST /webhook/{node_name}`, driven
//! through `tower::ServiceExt::oneshot` against the real `Supervisor`
//! (backed by a temp-file SQLite store) rather than a mocked handler.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use relaysync_core::{NodeConfig, Supervisor, SupervisorConfig};
use relaysync_server::config::Config;
use relaysync_server::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("relaysync.sqlite3");

    let nodes = vec![
        NodeConfig {
            name: "wan".to_string(),
            base_url: "http://127.0.0.1:9001".parse().unwrap(),
            api_key: "k1".to_string(),
            passwordless: false,
        },
        NodeConfig {
            name: "lan".to_string(),
            base_url: "http://127.0.0.1:9002".parse().unwrap(),
            api_key: "k2".to_string(),
            passwordless: true,
        },
    ];

    let supervisor_config = SupervisorConfig {
        database_path: db_path,
        nodes,
        path_sync_policy: vec![],
        worker: relaysync_core::worker::WorkerConfig::default(),
        debounce_window: chrono::Duration::seconds(30),
    };
    let supervisor = Arc::new(Supervisor::bootstrap(supervisor_config).await.unwrap());

    let config_toml = r#"
        [[servers]]
        name = "wan"
        url = "http://127.0.0.1:9001"
        api_key = "k1"

        [[servers]]
        name = "lan"
        url = "http://127.0.0.1:9002"
        api_key = "k2"
        passwordless = true
    "#;
    let config_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(config_file.path(), config_toml).unwrap();
    let config = Config::load(config_file.path()).unwrap();

    let state = AppState {
        supervisor,
        config: Arc::new(config),
    };
    (state, dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn accepts_recognized_notification_from_known_node() {
    let (state, _dir) = test_state().await;
    let app = relaysync_server::create_app(state);

    let body = json!({
        "NotificationType": "UserDataSaved",
        "NotificationUsername": "alice",
        "UserId": "u-1",
        "ItemId": "item-1",
        "Path": "/movies/a.mkv",
        "IsFavorite": true,
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/wan")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["enqueued_ids"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rejects_notification_from_unconfigured_node() {
    let (state, _dir) = test_state().await;
    let app = relaysync_server::create_app(state);

    let body = json!({
        "NotificationType": "UserDataSaved",
        "NotificationUsername": "alice",
        "UserId": "u-1",
        "Path": "/movies/a.mkv",
        "IsFavorite": true,
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/ghost-node")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejects_unrecognized_notification_type() {
    let (state, _dir) = test_state().await;
    let app = relaysync_server::create_app(state);

    let body = json!({
        "NotificationType": "SomethingNobodySends",
        "NotificationUsername": "alice",
        "UserId": "u-1",
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/wan")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn healthz_is_always_ok() {
    let (state, _dir) = test_state().await;
    let app = relaysync_server::create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
