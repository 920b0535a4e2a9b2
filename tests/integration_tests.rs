//! End-to-end tests for the switchboard control plane
//!
//! These drive the full router with a fabricated process table, spawner,
//! and HTTP client: model-triggered switching, proxying, stream rewriting,
//! and the admin endpoints.

use axum::Router;
use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use switchboard::test_utils::{FakeLister, FakeSpawner, MockHttpClient, test_config};
use switchboard::{AppState, build_app};
use tower::util::ServiceExt; // for oneshot()

fn build(client: MockHttpClient, lister: FakeLister) -> (Router, AppState<MockHttpClient>) {
    let spawner = FakeSpawner::new(lister.clone());
    let state = AppState::with_parts(
        &test_config(),
        client,
        Box::new(lister),
        Box::new(spawner),
    );
    (build_app(state.clone()), state)
}

fn running_backend(lister: &FakeLister) {
    lister.add(
        11,
        None,
        vec![
            "vllm".to_string(),
            "serve".to_string(),
            "Qwen/Qwen2.5-7B-Instruct".to_string(),
            "--port".to_string(),
            "8000".to_string(),
            "--served-model-name".to_string(),
            "qwen".to_string(),
        ],
    );
}

fn post_json(uri: &str, body: Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn get(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_models_listing() {
    let (app, _) = build(
        MockHttpClient::new(StatusCode::OK, "{}"),
        FakeLister::default(),
    );

    let response = app.oneshot(get("/v1/models")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"qwen"));
}

#[tokio::test]
async fn test_chat_request_launches_backend_and_proxies() {
    let client = MockHttpClient::new(StatusCode::OK, r#"{"id": "chatcmpl-1"}"#);
    let (app, _) = build(client.clone(), FakeLister::default());

    // Nothing is running; the request itself triggers the switch.
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "qwen",
                "messages": [{"role": "user", "content": "Hello"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "chatcmpl-1");

    // The launch probed health, then the request was forwarded to the
    // managed port.
    let requests = client.requests();
    assert!(requests.iter().any(|u| u.contains("/health")));
    assert!(
        requests
            .iter()
            .any(|u| u.contains(":8000/v1/chat/completions"))
    );
}

#[tokio::test]
async fn test_unknown_model_is_not_found() {
    let (app, _) = build(
        MockHttpClient::new(StatusCode::OK, "{}"),
        FakeLister::default(),
    );

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({ "model": "no-such-model", "messages": [] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_streaming_response_is_rewritten_in_flight() {
    let chunk = json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 0,
        "model": "qwen",
        "choices": [{
            "index": 0,
            "delta": {"content": "<think>planning</think>the answer"},
            "finish_reason": null
        }]
    });
    let client = MockHttpClient::new_streaming(
        StatusCode::OK,
        vec![
            format!("data: {chunk}\n\n"),
            "data: [DONE]\n\n".to_string(),
        ],
    );

    let lister = FakeLister::default();
    running_backend(&lister);
    let (app, _) = build(client, lister);

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "qwen",
                "messages": [{"role": "user", "content": "Hello"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();

    let rewritten: Value = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .find(|d| d.trim() != "[DONE]")
        .map(|d| serde_json::from_str(d).unwrap())
        .unwrap();
    let delta = &rewritten["choices"][0]["delta"];
    assert_eq!(delta["content"], "the answer");
    assert_eq!(delta["reasoning_content"], "planning");
    assert!(text.contains("data: [DONE]"));
}

#[tokio::test]
async fn test_admin_switch_evict_roundtrip() {
    let (app, _) = build(
        MockHttpClient::new(StatusCode::OK, "{}"),
        FakeLister::default(),
    );

    // Nothing running yet.
    let response = app.clone().oneshot(get("/admin/process")).await.unwrap();
    assert_eq!(body_json(response).await, Value::Null);

    let response = app
        .clone()
        .oneshot(post_empty("/admin/switch/qwen"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    assert_eq!(result["success"], true);
    let pid = result["pid"].as_u64().unwrap();

    let response = app.clone().oneshot(get("/admin/process")).await.unwrap();
    let handle = body_json(response).await;
    assert_eq!(handle["pid"].as_u64().unwrap(), pid);
    assert_eq!(handle["model_path"], "Qwen/Qwen2.5-7B-Instruct");

    let response = app
        .clone()
        .oneshot(post_empty("/admin/evict?force=true"))
        .await
        .unwrap();
    let evicted = body_json(response).await;
    assert_eq!(evicted["evicted"].as_u64().unwrap(), pid);

    let response = app.oneshot(get("/admin/process")).await.unwrap();
    assert_eq!(body_json(response).await, Value::Null);
}

#[tokio::test]
async fn test_admin_switch_unknown_recipe() {
    let (app, _) = build(
        MockHttpClient::new(StatusCode::OK, "{}"),
        FakeLister::default(),
    );

    let response = app.oneshot(post_empty("/admin/switch/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let result = body_json(response).await;
    assert_eq!(result["success"], false);
}

#[tokio::test]
async fn test_events_endpoint_streams_launch_progress() {
    let (app, _) = build(
        MockHttpClient::new(StatusCode::OK, "{}"),
        FakeLister::default(),
    );

    // Subscribe first so the switch's events land in our queue.
    let events = app.clone().oneshot(get("/events")).await.unwrap();
    assert_eq!(events.status(), StatusCode::OK);
    assert_eq!(
        events.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let mut stream = events.into_body().into_data_stream();

    let response = app.oneshot(post_empty("/admin/switch/qwen")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut collected = String::new();
    while let Ok(Some(Ok(chunk))) =
        tokio::time::timeout(Duration::from_millis(200), stream.next()).await
    {
        collected.push_str(std::str::from_utf8(&chunk).unwrap());
        if collected.contains("\"state\":\"ready\"") {
            break;
        }
    }

    assert!(collected.contains("event: launch_progress"));
    assert!(collected.contains("\"state\":\"ready\""));
    assert!(collected.contains("timestamp"));
}

#[tokio::test]
async fn test_cancel_endpoint_aborts_in_flight_launch() {
    let (app, state) = build(
        MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "starting"),
        FakeLister::default(),
    );

    let orchestrator = Arc::clone(&state.orchestrator);
    let attempt = tokio::spawn(async move { orchestrator.switch_to("qwen").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = app
        .oneshot(post_empty("/admin/cancel?recipe=qwen"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["cancelled"], 1);

    let result = attempt.await.unwrap();
    assert!(!result.success);
    assert!(result.message.contains("cancelled"));
}

#[tokio::test]
async fn test_request_without_model_requires_running_backend() {
    let (app, _) = build(
        MockHttpClient::new(StatusCode::OK, "{}"),
        FakeLister::default(),
    );

    // No model anywhere in the request and nothing running: 503.
    let response = app
        .clone()
        .oneshot(get("/some/backend/path"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // With a backend up, the same request is forwarded.
    let lister = FakeLister::default();
    running_backend(&lister);
    let (app, _) = build(MockHttpClient::new(StatusCode::OK, "{}"), lister);
    let response = app.oneshot(get("/some/backend/path")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
