//! Remote actions against a stub HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use conductor_actions::{ActionError, ActionKind, ActionRuntime, CommandLauncher, Kwargs};
use parking_lot::Mutex;
use serde_json::{json, Value};

type Seen = Arc<Mutex<Vec<(String, Value)>>>;

async fn spec() -> Json<Value> {
    Json(json!({
        "ner.detect": ["text"],
        "ner.setup": ["model"],
        "ner.broken": []
    }))
}

async fn detect(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    seen.lock().push(("detect".into(), body));
    Json(json!({"entities": [{"label": "GREETING", "span": [0, 2]}]}))
}

async fn setup(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    seen.lock().push(("setup".into(), body));
    Json(json!({"ok": true}))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded")
}

async fn start_stub() -> (String, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/action_spec", get(spec))
        .route("/detect", post(detect))
        .route("/setup", post(setup))
        .route("/broken", post(broken))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

fn runtime() -> ActionRuntime {
    ActionRuntime::new(
        Arc::new(CommandLauncher::new("/nonexistent/conductor")),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn test_remote_invoke_round_trip() {
    let (url, seen) = start_stub().await;
    let rt = runtime();

    let names = rt.load_remote(&url, &Value::Null).await.unwrap();
    assert_eq!(names, vec!["ner.broken", "ner.detect", "ner.setup"]);
    assert!(rt
        .list_actions()
        .iter()
        .all(|a| a.kind == ActionKind::RemoteProxy));

    let mut kwargs = Kwargs::new();
    kwargs.insert("text".into(), json!("hi"));
    let result = rt.invoke("ner.detect", vec![], kwargs).await.unwrap();

    assert_eq!(
        result,
        json!({"entities": [{"label": "GREETING", "span": [0, 2]}]})
    );
    assert_eq!(
        seen.lock().clone(),
        vec![("detect".to_string(), json!({"text": "hi"}))]
    );
}

#[tokio::test]
async fn test_positional_args_follow_param_order() {
    let (url, seen) = start_stub().await;
    let rt = runtime();
    rt.load_remote(&url, &json!({})).await.unwrap();

    rt.invoke("ner.detect", vec![json!("hello")], Kwargs::new())
        .await
        .unwrap();
    assert_eq!(seen.lock()[0].1, json!({"text": "hello"}));
}

#[tokio::test]
async fn test_setup_action_runs_with_context() {
    let (url, seen) = start_stub().await;
    let rt = runtime();

    rt.load_remote(&url, &json!({"model": "small"}))
        .await
        .unwrap();
    assert_eq!(
        seen.lock().clone(),
        vec![("setup".to_string(), json!({"model": "small"}))]
    );
}

#[tokio::test]
async fn test_http_failure_surfaces_status() {
    let (url, _seen) = start_stub().await;
    let rt = runtime();
    rt.load_remote(&url, &Value::Null).await.unwrap();

    let err = rt
        .invoke("ner.broken", vec![], Kwargs::new())
        .await
        .unwrap_err();
    match err {
        ActionError::Remote {
            status, message, ..
        } => {
            assert_eq!(status, Some(500));
            assert_eq!(message, "model not loaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_discovery() {
    let rt = runtime();
    let err = rt
        .load_remote("http://127.0.0.1:9", &Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, ActionError::Remote { .. }));
    assert!(rt.list_actions().is_empty());
}
