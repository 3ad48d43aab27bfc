mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{data_layer, ScriptedStore};
use docshield_core::{CallContext, DocumentId, StoreError};
use docshield_gateway::{routes, ReadOptions};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_every_probe() {
    let layer = Arc::new(data_layer(Arc::new(ScriptedStore::new())).await);

    let response = routes(layer).oneshot(get("/health")).await.unwrap();

    let body = body_json(response).await;
    for check in ["backend", "cache", "memory", "performance"] {
        assert!(body["checks"].get(check).is_some(), "missing {}", check);
    }
    assert_eq!(body["checks"]["backend"]["status"], "healthy");
}

#[tokio::test]
async fn readiness_follows_backend() {
    let store = Arc::new(ScriptedStore::new());
    let layer = Arc::new(data_layer(store.clone()).await);

    let response = routes(layer.clone()).oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    store.fail_always(StoreError::unavailable("backend down"));
    let response = routes(layer).oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = body_json(response).await;
    assert_eq!(body["ready"], false);
    assert_eq!(body["checks"][0], "backend");
}

#[tokio::test]
async fn snapshot_and_error_resolution() {
    let layer = Arc::new(data_layer(Arc::new(ScriptedStore::new())).await);
    let suppliers = layer.gateway::<Value>("suppliers");
    suppliers
        .find_by_id(
            &DocumentId::from("missing"),
            &CallContext::for_user("u-2"),
            ReadOptions::default(),
        )
        .await;

    let response = routes(layer.clone())
        .oneshot(get("/monitoring/snapshot"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["errors"]["total_errors"], 1);
    assert_eq!(snapshot["circuit_breakers"][0]["name"], "suppliers:find_by_id");

    let response = routes(layer.clone())
        .oneshot(get("/monitoring/errors?service=suppliers&resolved=false"))
        .await
        .unwrap();
    let errors = body_json(response).await;
    let id = errors[0]["id"].as_str().unwrap().to_string();

    let resolve = Request::builder()
        .method("POST")
        .uri(format!("/monitoring/errors/{}/resolve", id))
        .body(Body::empty())
        .unwrap();
    let response = routes(layer.clone()).oneshot(resolve).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(layer.tracker().get_error(&id).unwrap().resolved);

    let unknown = Request::builder()
        .method("POST")
        .uri("/monitoring/errors/nope/resolve")
        .body(Body::empty())
        .unwrap();
    let response = routes(layer).oneshot(unknown).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
