//! HTTP surface of the hub, driven through the router without a socket.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tower::ServiceExt;

use conversion_hub::manager::{ConnectionManager, ManagerSettings, Outbound};
use conversion_hub::router::create_router;

fn setup() -> (Arc<ConnectionManager>, Router) {
    let manager = Arc::new(ConnectionManager::new(ManagerSettings::default()));
    let router = create_router(manager.clone());
    (manager, router)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Outbound::Text(text)) = rx.try_recv() {
        frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (_manager, router) = setup();
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn publish_fans_out_to_conversion_sockets() {
    let (manager, router) = setup();
    let (tx, mut rx) = unbounded_channel();
    manager.connect("job-42", "browser-1", None, tx).unwrap();
    drain(&mut rx);

    let request = post_json(
        "/v0/conversions/job-42/events",
        json!({ "type": "progress_update", "progress": 55.0, "stage": "remapping textures" }),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["delivered"], 1);

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "progress_update");
    assert_eq!(frames[0]["conversion_id"], "job-42");
    assert_eq!(frames[0]["progress"], 55);
    assert_eq!(frames[0]["stage"], "remapping textures");
}

#[tokio::test]
async fn publish_without_listeners_is_replayed_later() {
    let (manager, router) = setup();
    let request = post_json(
        "/v0/conversions/job-7/events",
        json!({ "type": "conversion_failed", "error": "unsupported block entity" }),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(body_json(response).await["delivered"], 0);

    let (tx, mut rx) = unbounded_channel();
    manager.connect("job-7", "late", None, tx).unwrap();
    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1]["type"], "conversion_failed");
    assert_eq!(frames[1]["error"], "unsupported block entity");
}

#[tokio::test]
async fn publish_rejects_unknown_event_type() {
    let (_manager, router) = setup();
    let request = post_json("/v0/conversions/job-1/events", json!({ "type": "heartbeat" }));
    let response = router.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn lists_connections_and_stats() {
    let (manager, router) = setup();
    let (tx1, _rx1) = unbounded_channel();
    let (tx2, _rx2) = unbounded_channel();
    manager.connect("job-1", "a", Some("user-1".to_string()), tx1).unwrap();
    manager.connect("job-1", "b", None, tx2).unwrap();

    let response = router
        .clone()
        .oneshot(get("/v0/conversions/job-1/connections"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|c| c["user_id"] == "user-1"));

    let response = router.oneshot(get("/v0/stats")).await.unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["active_connections"], 2);
    assert_eq!(stats["active_conversions"], 1);
    assert_eq!(stats["total_connections"], 2);
}

#[tokio::test]
async fn websocket_route_requires_upgrade() {
    let (_manager, router) = setup();
    let response = router.oneshot(get("/ws/job-1?client_id=abc")).await.unwrap();
    assert!(response.status().is_client_error());
}
