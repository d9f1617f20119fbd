//! HTTP surface tests, driven through the router without a socket.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{spawn_app, TestApp};
use quota_service::startup::{router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn app_router(app: &TestApp) -> Router {
    router(AppState::new(app.quota.clone()))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok_with_request_id() {
    let app = spawn_app();

    let response = app_router(&app).oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn consume_returns_decision() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    let response = app_router(&app)
        .oneshot(post_json(
            "/v1/quota/consume",
            json!({ "user_id": user, "metric": "exports", "amount": 2 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["remaining"], 3);
    assert_eq!(body["reason"], "success");
}

#[tokio::test]
async fn quota_denial_is_a_successful_response() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    app.consume(user, quota_service::models::Metric::Projects, 3)
        .await;

    let response = app_router(&app)
        .oneshot(post_json(
            "/v1/quota/consume",
            json!({ "user_id": user, "metric": "projects", "amount": 1 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "quota_exceeded");
}

fn consume_from(ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/quota/consume")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn rate_limited_consume_gets_429_with_retry_after() {
    let app = spawn_app();
    let router = app_router(&app);

    // Different users behind one address share the limit.
    for _ in 0..20 {
        let body = json!({ "user_id": Uuid::new_v4(), "metric": "api_calls", "amount": 1 });
        let response = router
            .clone()
            .oneshot(consume_from("203.0.113.9", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let body = json!({ "user_id": Uuid::new_v4(), "metric": "api_calls", "amount": 1 });
    let response = router
        .clone()
        .oneshot(consume_from("203.0.113.9", body.clone()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
    let denied = body_json(response).await;
    assert_eq!(denied["rate_limited"], true);

    let response = router
        .oneshot(consume_from("198.51.100.4", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn caller_ip_in_the_body_does_not_reset_the_limit() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let router = app_router(&app);
    let body = |n: u32| {
        json!({
            "user_id": user,
            "metric": "api_calls",
            "amount": 1,
            "caller_ip": format!("10.0.0.{}", n),
        })
    };

    for n in 0..20 {
        let response = router
            .clone()
            .oneshot(post_json("/v1/quota/consume", body(n)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = router
        .oneshot(post_json("/v1/quota/consume", body(20)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(app.usage(user, quota_service::models::Metric::ApiCalls).await, 20);
}

#[tokio::test]
async fn idempotency_key_header_is_honoured() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let router = app_router(&app);
    let request = || {
        Request::builder()
            .method("POST")
            .uri("/v1/quota/consume")
            .header(header::CONTENT_TYPE, "application/json")
            .header("idempotency-key", "hdr-1")
            .body(Body::from(
                json!({ "user_id": user, "metric": "exports", "amount": 1 }).to_string(),
            ))
            .unwrap()
    };

    router.clone().oneshot(request()).await.unwrap();
    let response = router.oneshot(request()).await.unwrap();

    let body = body_json(response).await;
    assert_eq!(body["already_processed"], true);
    assert_eq!(app.usage(user, quota_service::models::Metric::Exports).await, 1);
}

#[tokio::test]
async fn invalid_amount_is_unprocessable() {
    let app = spawn_app();

    let response = app_router(&app)
        .oneshot(post_json(
            "/v1/quota/consume",
            json!({ "user_id": Uuid::new_v4(), "metric": "exports", "amount": 0 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Validation error");
}

#[tokio::test]
async fn oversized_idempotency_key_is_unprocessable() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let router = app_router(&app);
    let key = "k".repeat(300);

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/quota/consume",
            json!({ "user_id": user, "metric": "exports", "amount": 1, "idempotency_key": key }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/quota/consume")
                .header(header::CONTENT_TYPE, "application/json")
                .header("idempotency-key", key.as_str())
                .body(Body::from(
                    json!({ "user_id": user, "metric": "exports", "amount": 1 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(app.usage(user, quota_service::models::Metric::Exports).await, 0);
}

#[tokio::test]
async fn malformed_bodies_are_unprocessable() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let router = app_router(&app);

    let cases = [
        (
            format!("/v1/users/{}/buckets", user),
            json!({ "source": "package", "seconds": -5 }),
        ),
        (
            format!("/v1/users/{}/time/consume", user),
            json!({ "seconds": 0 }),
        ),
        (
            format!("/v1/users/{}/bonus-grants", user),
            json!({ "metric": "exports", "amount": 0, "expires_at": null }),
        ),
        (
            "/v1/events/subscription-changed".to_string(),
            json!({
                "user_id": user,
                "old_plan": "free",
                "new_plan": "p".repeat(256),
                "effective_at": app.now(),
            }),
        ),
    ];

    for (uri, body) in cases {
        let response = router.clone().oneshot(post_json(&uri, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", uri);
    }
    assert!(app.store.plan_changes(user).await.is_empty());
}

#[tokio::test]
async fn unknown_metric_in_path_is_a_bad_request() {
    let app = spawn_app();

    let response = app_router(&app)
        .oneshot(get(&format!("/v1/users/{}/usage/storage", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn usage_endpoint_reports_plan_and_remaining() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    app.consume(user, quota_service::models::Metric::AiGenerations, 4)
        .await;

    let response = app_router(&app)
        .oneshot(get(&format!("/v1/users/{}/usage/ai_generations", user)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["current_usage"], 4);
    assert_eq!(body["remaining"], 6);
    assert_eq!(body["plan_name"], "free");
}

#[tokio::test]
async fn missing_balance_is_not_found() {
    let app = spawn_app();

    let response = app_router(&app)
        .oneshot(get(&format!("/v1/users/{}/balance", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn balance_lifecycle_over_http() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let router = app_router(&app);

    let response = router
        .clone()
        .oneshot(post_json(&format!("/v1/users/{}/balance", user), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/v1/users/{}/buckets", user),
            json!({ "source": "package", "seconds": 600 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/v1/users/{}/time/consume", user),
            json!({ "seconds": 5000 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = router
        .oneshot(get(&format!("/v1/users/{}/balance", user)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total_paid_seconds"], 2400);
    assert_eq!(body["buckets"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn bonus_grant_and_subscription_event_are_created() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let router = app_router(&app);

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/v1/users/{}/bonus-grants", user),
            json!({ "metric": "exports", "amount": 10, "expires_at": null }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let grant = body_json(response).await;
    assert_eq!(grant["amount_granted"], 10);

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/events/subscription-changed",
            json!({
                "user_id": user,
                "old_plan": "free",
                "new_plan": "pro",
                "effective_at": app.now(),
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router
        .oneshot(get(&format!("/v1/users/{}/audit?limit=5", user)))
        .await
        .unwrap();
    let audit = body_json(response).await;
    assert_eq!(audit.as_array().unwrap().len(), 1);
    assert_eq!(audit[0]["reason"], "plan_changed");
}
