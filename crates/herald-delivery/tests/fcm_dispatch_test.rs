//! FCM dispatch scenarios against a stubbed send endpoint.

use std::sync::Arc;

use herald_core::{FcmAuth, Multiplexed, Request};
use herald_delivery::{FcmService, PushService, WorkerPool};
use herald_testing::TestClock;
use serde_json::value::RawValue;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn raw(json: &str) -> Box<RawValue> {
    RawValue::from_string(json.to_string()).expect("valid JSON")
}

fn fcm_request(devices: &[&str]) -> Request {
    Request {
        push_id: "p1".into(),
        custom_id: "c1".into(),
        fcm: Some(FcmAuth { auth_key: "k".into() }),
        multiplexed: Some(Multiplexed {
            devices: devices.iter().map(ToString::to_string).collect(),
            payload: raw(r#"{"notification":{"title":"hi"}}"#),
        }),
        ..Request::default()
    }
}

async fn service_for(server: &MockServer) -> (FcmService, Arc<WorkerPool>) {
    let pool = Arc::new(WorkerPool::new(8));
    pool.start();
    let service = FcmService::with_endpoint(
        pool.clone(),
        Arc::new(TestClock::new()),
        format!("{}/fcm/send", server.uri()),
    )
    .expect("service builds");
    (service, pool)
}

fn success_body() -> serde_json::Value {
    serde_json::json!({
        "multicast_id": 1,
        "success": 1,
        "failure": 0,
        "canonical_ids": 0,
        "results": [{"message_id": "m"}]
    })
}

#[tokio::test]
async fn multiplexed_request_delivers_every_device() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .and(matchers::header("Authorization", "key=k"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(2)
        .mount(&server)
        .await;

    let (service, pool) = service_for(&server).await;
    let response = service.process(fcm_request(&["t1", "t2"])).await;

    assert_eq!(response.devices.len(), 2);
    assert!(response.devices.iter().all(|device| device.delivered));
    assert_eq!(response.success, 2);
    assert_eq!(response.failure, 0);
    assert_eq!(response.service, "fcm");
    assert_eq!(response.push_id, "p1");
    assert_eq!(response.custom_id, "c1");
    assert!(!response.failed);

    pool.stop().await;
    server.verify().await;
}

#[tokio::test]
async fn device_count_is_conserved_across_both_sets() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    let mut request = fcm_request(&["t1", "t2"]);
    request.batched = Some(
        [("b1", r#"{"data":{"k":"1"}}"#), ("b2", r#"{"data":{"k":"2"}}"#)]
            .into_iter()
            .map(|(token, payload)| (token.to_string(), raw(payload)))
            .collect(),
    );

    let (service, pool) = service_for(&server).await;
    let response = service.process(request).await;

    assert_eq!(response.devices.len(), 4);
    assert_eq!(response.success + response.failure, 4);

    pool.stop().await;
}

#[tokio::test]
async fn per_device_error_is_reported_without_failing_the_request() {
    let server = MockServer::start().await;
    // Specific stub for t2 first; wiremock picks the first matching mock.
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .and(matchers::body_partial_json(
            serde_json::json!({"registration_ids": ["t2"]}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "multicast_id": 1,
            "success": 0,
            "failure": 1,
            "canonical_ids": 0,
            "results": [{"error": "NotRegistered"}]
        })))
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    let (service, pool) = service_for(&server).await;
    let response = service.process(fcm_request(&["t1", "t2"])).await;

    assert_eq!(response.devices.len(), 2);
    assert_eq!(response.success, 1);
    assert_eq!(response.failure, 1);
    assert!(!response.failed, "per-device failures never fail the request");

    let failed = response
        .devices
        .iter()
        .find(|device| !device.delivered)
        .expect("one undelivered device");
    assert_eq!(failed.identifier, "t2");
    assert_eq!(
        failed.error.as_ref().expect("error set").description,
        "NotRegistered"
    );

    pool.stop().await;
}

#[tokio::test]
async fn canonical_token_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "multicast_id": 1,
            "success": 1,
            "failure": 0,
            "canonical_ids": 1,
            "results": [{"message_id": "m", "registration_id": "replacement-token"}]
        })))
        .mount(&server)
        .await;

    let (service, pool) = service_for(&server).await;
    let response = service.process(fcm_request(&["t1"])).await;

    assert_eq!(response.devices[0].canonical, "replacement-token");
    assert!(response.devices[0].delivered);

    pool.stop().await;
}

#[tokio::test]
async fn server_error_updates_shared_backoff() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .respond_with(
            ResponseTemplate::new(503)
                .append_header("Retry-After", "7")
                .set_body_string("unavailable"),
        )
        .mount(&server)
        .await;

    let (service, pool) = service_for(&server).await;
    assert!(!service.should_wait());

    let response = service.process(fcm_request(&["t1"])).await;

    let device = &response.devices[0];
    assert!(!device.delivered);
    assert!(device.should_retry);
    let error = device.error.as_ref().expect("error set");
    assert_eq!(error.code, 503);
    assert!(error.should_retry);
    assert!(error.retry_at.is_some());

    assert!(service.should_wait());
    // Retry-After (7) plus the first escalation step (5).
    assert!(service.retry_after() >= 12 - 1, "retry_after was {}", service.retry_after());

    pool.stop().await;
}

#[tokio::test]
async fn wrong_api_key_maps_to_401() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/fcm/send"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let (service, pool) = service_for(&server).await;
    let response = service.process(fcm_request(&["t1"])).await;
    let error = response.devices[0].error.as_ref().expect("error set");
    assert_eq!(error.code, 401);
    assert_eq!(error.description, "wrong api key");
    assert!(!error.should_retry);

    pool.stop().await;
}

#[tokio::test]
async fn empty_request_short_circuits_with_echoed_ids() {
    let server = MockServer::start().await;
    let (service, pool) = service_for(&server).await;

    let request = Request {
        push_id: "p".into(),
        fcm: Some(FcmAuth { auth_key: "k".into() }),
        ..Request::default()
    };
    let response = service.process(request).await;

    assert!(response.devices.is_empty());
    assert_eq!(response.success, 0);
    assert_eq!(response.failure, 0);
    assert_eq!(response.push_id, "p");
    assert_eq!(response.service, "fcm");
    assert!(response.error.is_none());
    assert!(!response.failed);
    assert!(
        server.received_requests().await.expect("request log").is_empty(),
        "no backend call for an empty request"
    );

    pool.stop().await;
}
