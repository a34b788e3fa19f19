use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tracksim_core::config::CourierCredential;
use tracksim_core::session::{AuthError, FetchError, ReportError, SessionToken};
use tracksim_core::{
    CourierSession, DeliveryStatus, GeoPoint, HttpTrackingApi, Reconciler, TaskOutcome,
    TrackingApi,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::support::{config, eventually};

const COURIER: &str = "entregador1@exemplo.com";

fn api(server: &MockServer) -> HttpTrackingApi {
    HttpTrackingApi::new(format!("{}/api", server.uri()), Duration::from_secs(5)).unwrap()
}

fn credential() -> CourierCredential {
    CourierCredential::new(COURIER, "123456")
}

async fn mount_login(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({ "email": COURIER, "password": "123456" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": token })))
        .mount(server)
        .await;
}

fn delivery_json(id: &str, status: &str) -> serde_json::Value {
    json!({
        "id": id,
        "courierId": "u-1",
        "courier": { "email": COURIER, "name": "Burns" },
        "destinationLat": -23.541,
        "destinationLng": -46.624,
        "lastKnownLocation": { "latitude": -23.5605, "longitude": -46.6433 },
        "status": status,
        "productName": "Pizza"
    })
}

#[tokio::test]
async fn login_posts_credentials_and_returns_token() {
    let server = MockServer::start().await;
    mount_login(&server, "jwt-abc").await;

    let token = api(&server).login(&credential()).await.unwrap();

    assert_eq!(token.as_str(), "jwt-abc");
}

#[tokio::test]
async fn login_rejection_keeps_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid credentials"))
        .mount(&server)
        .await;

    let err = api(&server).login(&credential()).await.unwrap_err();

    match err {
        AuthError::Rejected { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "Invalid credentials");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn login_without_token_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": {} })))
        .mount(&server)
        .await;

    let err = api(&server).login(&credential()).await.unwrap_err();

    assert!(matches!(err, AuthError::Parse(_)));
}

#[tokio::test]
async fn fetch_sends_bearer_token_and_parses_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/deliveries"))
        .and(header("authorization", "Bearer jwt-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            delivery_json("d-1", "IN_TRANSIT"),
            delivery_json("d-2", "pending"),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let records = api(&server)
        .fetch_deliveries(&SessionToken::new("jwt-abc"))
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, DeliveryStatus::InTransit);
    assert_eq!(records[1].status, DeliveryStatus::Pending);
    assert_eq!(records[0].courier_identity(), Some(COURIER));
}

#[tokio::test]
async fn fetch_maps_unauthorized_and_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/deliveries"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/deliveries"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
        .mount(&server)
        .await;
    let api = api(&server);

    let stale = api.fetch_deliveries(&SessionToken::new("stale")).await;
    let fresh = api.fetch_deliveries(&SessionToken::new("fresh")).await;

    assert!(matches!(stale, Err(FetchError::Unauthorized)));
    assert!(matches!(fresh, Err(FetchError::Status { status: 500, .. })));
}

#[tokio::test]
async fn report_posts_camel_case_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/locations"))
        .and(header("authorization", "Bearer jwt-abc"))
        .and(body_json(json!({
            "deliveryId": "d-1",
            "latitude": -23.55,
            "longitude": -46.63
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "loc-1",
            "deliveryId": "d-1",
            "latitude": -23.55,
            "longitude": -46.63,
            "timestamp": "2025-06-20T12:00:00.000Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ack = api(&server)
        .report_location(
            &SessionToken::new("jwt-abc"),
            "d-1",
            GeoPoint::new(-23.55, -46.63),
        )
        .await
        .unwrap();

    assert_eq!(ack.id.as_deref(), Some("loc-1"));
    assert_eq!(ack.delivery_id.as_deref(), Some("d-1"));
    assert!(ack.timestamp.is_some());
}

#[tokio::test]
async fn report_statuses_are_classified() {
    let cases = [
        (401u16, ReportError::Unauthorized),
        (403, ReportError::Rejected { status: 403 }),
        (404, ReportError::Rejected { status: 404 }),
        (
            400,
            ReportError::Invalid {
                status: 400,
                body: "bad".to_string(),
            },
        ),
    ];
    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/locations"))
            .respond_with(ResponseTemplate::new(status).set_body_string("bad"))
            .mount(&server)
            .await;

        let err = api(&server)
            .report_location(&SessionToken::new("t"), "d-1", GeoPoint::new(0.0, 0.0))
            .await
            .unwrap_err();

        assert_eq!(err, expected, "status {status}");
    }
}

#[tokio::test]
async fn unreachable_service_is_transient() {
    let api = HttpTrackingApi::new("http://127.0.0.1:9/api", Duration::from_millis(500)).unwrap();

    let err = api
        .report_location(&SessionToken::new("t"), "d-1", GeoPoint::new(0.0, 0.0))
        .await
        .unwrap_err();

    assert!(matches!(err, ReportError::Transient(_)));
}

#[tokio::test]
async fn session_fetches_snapshot_over_http() {
    let server = MockServer::start().await;
    mount_login(&server, "jwt-abc").await;
    Mock::given(method("GET"))
        .and(path("/api/deliveries"))
        .and(header("authorization", "Bearer jwt-abc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([delivery_json("d-1", "ASSIGNED")])),
        )
        .mount(&server)
        .await;

    let session = CourierSession::authenticate(Arc::new(api(&server)), &credential())
        .await
        .unwrap();
    let snapshot = session.fetch_active_deliveries().await.unwrap();

    assert_eq!(session.identity(), COURIER);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.active_ids().contains("d-1"));
}

#[tokio::test]
async fn reconciler_streams_a_trip_against_http_service() {
    let server = MockServer::start().await;
    mount_login(&server, "jwt-abc").await;
    Mock::given(method("GET"))
        .and(path("/api/deliveries"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([delivery_json("d-1", "IN_TRANSIT")])),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/locations"))
        .and(header("authorization", "Bearer jwt-abc"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "loc" })))
        .expect(4)
        .mount(&server)
        .await;

    let mut config = config(&[COURIER], Duration::from_millis(1), 4);
    config.base_url = format!("{}/api", server.uri());
    let api = HttpTrackingApi::from_config(&config).unwrap();
    let mut reconciler = Reconciler::new(Arc::new(api), config);

    let summary = reconciler.sweep().await.unwrap();
    assert_eq!(summary.dispatched, 1);
    assert!(eventually(|| !reconciler.registry().is_live("d-1")).await);

    let finished = reconciler.shutdown().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].outcome, TaskOutcome::Completed { reported: 4 });
}
