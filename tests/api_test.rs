mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::Harness;
use payflow_core::{create_app, AppState};

fn app(h: &Harness) -> Router {
    create_app(AppState {
        engine: h.engine.clone(),
        db: None,
    })
}

fn post(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn charge(amount: &str) -> Value {
    json!({
        "merchant_id": "merchant-a",
        "customer_id": "cust-1",
        "amount": amount,
        "currency": "USD",
        "payment_token": "tok_visa"
    })
}

#[tokio::test]
async fn test_health_over_in_memory_adapters() {
    let h = Harness::new();
    let app = app(&h);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["db"], "in_memory");
}

#[tokio::test]
async fn test_missing_idempotency_key_is_bad_request() {
    let h = Harness::new();
    let app = app(&h);

    let (status, body) = send(&app, post("/transactions/sale", None, charge("10.00"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
    assert_eq!(h.gateway.calls(), 0);
}

#[tokio::test]
async fn test_sale_is_created_and_replayed() {
    let h = Harness::new();
    let app = app(&h);

    let (status, first) = send(&app, post("/transactions/sale", Some("sale-1"), charge("10.00"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "captured");

    let (status, second) = send(&app, post("/transactions/sale", Some("sale-1"), charge("10.00"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second["id"], first["id"]);
    assert_eq!(h.gateway.calls(), 1);

    let (status, conflict) = send(&app, post("/transactions/sale", Some("sale-1"), charge("11.00"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(conflict["kind"], "idempotency_conflict");
}

#[tokio::test]
async fn test_lifecycle_errors_map_to_status_codes() {
    let h = Harness::new();
    let app = app(&h);

    let (_, auth) = send(&app, post("/transactions/authorize", Some("auth-1"), charge("40.00"))).await;
    let group_id = auth["group_id"].as_str().unwrap().to_string();

    let (status, captured) = send(
        &app,
        post(&format!("/transactions/{}/capture", group_id), Some("capture-1"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(captured["status"], "captured");

    let (status, body) = send(
        &app,
        post(&format!("/transactions/{}/void", group_id), Some("void-1"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "invalid_state_transition");

    let (status, body) = send(
        &app,
        post(
            &format!("/transactions/{}/refund", group_id),
            Some("refund-1"),
            json!({ "amount": "40.01" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "refund_exceeds_captured");

    let request = Request::builder()
        .uri(format!("/groups/{}", group_id))
        .body(Body::empty())
        .unwrap();
    let (status, rows) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_declined_sale_is_payment_required() {
    let h = Harness::new();
    h.gateway.push(common::decline());
    let app = app(&h);

    let (status, body) = send(&app, post("/transactions/sale", Some("sale-declined"), charge("10.00"))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["retriable"], false);
    assert_eq!(body["code"], "05");
}

#[tokio::test]
async fn test_unknown_transaction_is_not_found() {
    let h = Harness::new();
    let app = app(&h);
    let request = Request::builder()
        .uri(format!("/transactions/{}", uuid::Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_subscription_created_and_billed_through_job_endpoint() {
    let h = Harness::new();
    let app = app(&h);
    let today = chrono::Utc::now().date_naive();

    let (status, sub) = send(
        &app,
        post(
            "/subscriptions",
            None,
            json!({
                "merchant_id": "merchant-a",
                "customer_id": "cust-1",
                "amount": "29.00",
                "currency": "USD",
                "frequency": "monthly",
                "payment_method_token": "tok_visa",
                "start_date": today.to_string(),
                "end_date": null
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sub["status"], "active");

    let (status, report) = send(&app, post("/jobs/billing/run", None, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["succeeded"], 1);

    let (status, body) = send(
        &app,
        post(&format!("/subscriptions/{}/cancel", sub["id"].as_str().unwrap()), None, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn test_webhook_endpoint_registration() {
    let h = Harness::new();
    let app = app(&h);

    let (status, endpoint) = send(
        &app,
        post(
            "/webhooks/endpoints",
            None,
            json!({
                "merchant_id": "merchant-a",
                "url": "https://hooks.example.com/payflow",
                "secret": "whsec_test"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(endpoint["merchant_id"], "merchant-a");

    let request = Request::builder()
        .uri("/webhooks/deliveries/failed?limit=5")
        .body(Body::empty())
        .unwrap();
    let (status, failed) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed, json!([]));
}
