mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{cluster, gateway};
use orb8_gateway::server::{router, SessionStore, SESSION_HEADER};
use std::time::Duration;
use orb8_rpc::codes;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> (Router, orb8_gateway::k8s::InMemoryCluster) {
    let c = cluster(&[("gpu-node-a", "agent-a"), ("gpu-node-b", "agent-b")]);
    (router(gateway(&c).server_state()), c)
}

fn rpc(body: Value, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(id) = session {
        builder = builder.header(SESSION_HEADER, id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn initialize(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(rpc(
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .expect("initialize issues a session id")
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "orb8-gateway");
    session
}

#[tokio::test]
async fn test_session_lifecycle() {
    let (app, _c) = app();
    let session = initialize(&app).await;

    let response = app
        .clone()
        .oneshot(rpc(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "get_gpu_health", "arguments": {} },
            }),
            Some(session.as_str()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(SESSION_HEADER).is_none());
    let body = body_json(response).await;
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["isError"], false);
    let payload = orb8_rpc::tool_payload(body["result"].clone());
    assert_eq!(payload["summary"]["succeeded"], 2);

    // Without the header the request lands in a fresh, uninitialized session
    let response = app
        .clone()
        .oneshot(rpc(json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }), None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], codes::NOT_INITIALIZED);

    let delete = Request::builder()
        .method(Method::DELETE)
        .uri("/mcp")
        .header(SESSION_HEADER, &session)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(rpc(
            json!({ "jsonrpc": "2.0", "id": 4, "method": "tools/list" }),
            Some(session.as_str()),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], codes::NOT_INITIALIZED);
}

#[tokio::test]
async fn test_notification_is_accepted_without_body() {
    let (app, _c) = app();
    let session = initialize(&app).await;

    let response = app
        .oneshot(rpc(
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            Some(session.as_str()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let (app, _c) = app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .body(Body::from("{\"jsonrpc\":"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], codes::PARSE_ERROR);
    assert!(body["id"].is_null());
}

#[tokio::test]
async fn test_probe_endpoints() {
    let (app, c) = app();

    let response = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready_agents"], 2);

    c.fail_api(Some("connection refused"));
    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    c.fail_api(None);

    let response = app.clone().oneshot(get("/version")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["version"], orb8_gateway::VERSION);
    assert_eq!(body["transport"], "exec");

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("orb8_gateway_"));
}

#[tokio::test]
async fn test_probe_endpoints_reject_other_methods() {
    let (app, _c) = app();

    for uri in ["/healthz", "/readyz", "/metrics", "/version"] {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{}", uri);
    }

    let response = app.oneshot(get("/mcp")).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_session_table_is_bounded() {
    let c = cluster(&[("gpu-node-a", "agent-a")]);
    let state = gateway(&c)
        .server_state()
        .with_sessions(SessionStore::new(Duration::from_secs(3600), 8));
    let sessions = state.sessions.clone();
    let app = router(state);

    let mut issued = Vec::new();
    for _ in 0..50 {
        issued.push(initialize(&app).await);
    }
    assert_eq!(sessions.len(), 8);

    // The oldest sessions were evicted, the newest still answer
    let response = app
        .clone()
        .oneshot(rpc(
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            Some(issued[0].as_str()),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["error"]["code"], codes::NOT_INITIALIZED);

    let response = app
        .oneshot(rpc(
            json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
            Some(issued[49].as_str()),
        ))
        .await
        .unwrap();
    assert!(body_json(response).await["result"]["tools"].is_array());
}
