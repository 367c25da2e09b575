#![cfg(feature = "transport-http")]

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use kyroql_exchange::batch::BatchConfig;
use kyroql_exchange::transport::router;
use kyroql_exchange::{Exchange, ExchangeConfig, InMemoryStore};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> (Arc<Exchange>, Router) {
    let config = ExchangeConfig {
        batch: BatchConfig {
            batch_size: 100,
            flush_interval_ms: 3_600_000,
            ..BatchConfig::default()
        },
        ..ExchangeConfig::default()
    };
    let exchange = Arc::new(Exchange::start(config, Arc::new(InMemoryStore::new())).unwrap());
    let app = router(Arc::clone(&exchange));
    (exchange, app)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn publish_then_query() {
    let (exchange, app) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/knowledge",
        Some(json!({
            "producerId": "w1",
            "type": "risk_pattern",
            "payload": "connection pool is never drained",
            "urgency": "high",
            "priority": 3
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["id"].as_str().unwrap().to_string();

    exchange.flush().unwrap();

    let (status, body) = call(&app, Method::GET, "/knowledge?types=risk_pattern&limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], id.as_str());
    assert_eq!(items[0]["urgency"], "high");

    let (status, body) = call(&app, Method::GET, &format!("/knowledge/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["producerId"], "w1");

    let (status, body) = call(&app, Method::GET, "/knowledge/fresh?minFreshness=0.5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(&app, Method::GET, "/stats/w1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["published"], 1);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let (_, app) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/knowledge",
        Some(json!({ "producerId": "w1", "type": "rumor", "payload": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("rumor"));

    let (status, _) = call(
        &app,
        Method::POST,
        "/knowledge",
        Some(json!({ "producerId": "", "type": "risk_pattern", "payload": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/knowledge?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/knowledge/fresh?minFreshness=1.5", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/knowledge/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/conflicts?status=maybe", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_records_are_not_found() {
    let (_, app) = app();

    let (status, _) = call(
        &app,
        Method::GET,
        "/knowledge/6f1c3a56-9a57-4f4e-8a55-8d1f3c2b7e10",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        Method::POST,
        "/conflicts/6f1c3a56-9a57-4f4e-8a55-8d1f3c2b7e10/resolve",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::GET, "/stats/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manual_conflict_resolution_over_http() {
    let (exchange, app) = app();
    for text in [
        "the audit log should be enabled in staging",
        "the audit log should not be enabled in staging",
    ] {
        let (status, _) = call(
            &app,
            Method::POST,
            "/knowledge",
            Some(json!({ "producerId": "w1", "type": "decision_made", "payload": text })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    exchange.flush().unwrap();

    let (status, body) = call(&app, Method::GET, "/conflicts?status=pending_manual", None).await;
    assert_eq!(status, StatusCode::OK);
    let parked = body.as_array().unwrap();
    assert_eq!(parked.len(), 1);
    let conflict_id = parked[0]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/conflicts/{conflict_id}/resolve"),
        Some(json!({ "strategy": "prioritize" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");

    let (status, body) = call(&app, Method::GET, &format!("/conflicts/{conflict_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");

    let (_, body) = call(&app, Method::GET, "/knowledge?types=decision_made", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn health_reports_counters() {
    let (exchange, app) = app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepting"], true);
    assert_eq!(body["pendingItems"], 0);

    exchange.shutdown();
    let (_, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(body["accepting"], false);
}
