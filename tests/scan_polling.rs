use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keelscan::client::ApiSession;
use keelscan::errors::Error;
use keelscan::events::NullSink;
use keelscan::scan::{Bom, ScanHandler, ScanOptions};

const ORG: &str = "TESTORG";
const DIGEST: &str = "sha256:feedface";
const TAG: &str = "docker.io/library/app:1.0";
const OP: &str = "op-1";

fn handler_for(server: &MockServer) -> ScanHandler {
    let session = ApiSession::new("access-id", "access-key").unwrap();
    let mut handler = ScanHandler::new(
        session,
        &server.uri(),
        ORG,
        "CICD",
        "default",
        Arc::new(NullSink),
    )
    .with_poll_timing(
        Duration::from_millis(10),
        Duration::from_millis(25),
        Duration::from_secs(5),
    );
    let bom = Bom {
        full_tag: TAG.to_string(),
        manifest_digest: DIGEST.to_string(),
        packages: json!({"layers": []}),
    };
    handler.attach_data(bom, Vec::new(), "sha256:cfg", "0.9.0");
    handler
}

fn put_path() -> String {
    format!("/v1/orgs/{ORG}/analyzer/images/{DIGEST}/operations/{OP}")
}

fn status_path() -> String {
    format!("/v1/orgs/{ORG}/analyzer/images/{DIGEST}/operations/{OP}/status")
}

fn report_path() -> String {
    format!("/v1/orgs/{ORG}/analyzer/images/{DIGEST}/vulnerabilities")
}

fn scanned_report() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "manifest_digest": DIGEST,
        "image_id": "sha256:cfg",
        "full_tag": TAG,
        "scan_status": "SCANNED",
        "vulnerabilities": {"critical": 1},
    }))
}

#[tokio::test]
async fn already_scanned_image_skips_polling() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .and(query_param("full_tag", TAG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "FINISHED"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(report_path()))
        .and(query_param("full_tag", TAG))
        .respond_with(scanned_report())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let report = handler
        .scan(OP, &ScanOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.scan_status, "SCANNED");
    assert_eq!(report.vulnerabilities["critical"], 1);
}

#[tokio::test]
async fn polling_waits_through_queued_states() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "QUEUED"
        })))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "FINISHED"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(report_path()))
        .respond_with(scanned_report())
        .expect(1)
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let report = handler
        .scan(OP, &ScanOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.scan_status, "SCANNED");
}

#[tokio::test]
async fn missing_operation_counts_as_queued() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "FINISHED"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(report_path()))
        .respond_with(scanned_report())
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let report = handler
        .scan(OP, &ScanOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.scan_status, "SCANNED");
}

#[tokio::test]
async fn transient_status_errors_do_not_end_the_scan() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "FINISHED"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(report_path()))
        .respond_with(scanned_report())
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let report = handler
        .scan(OP, &ScanOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.scan_status, "SCANNED");
}

#[tokio::test]
async fn backend_failure_status_is_terminal() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "FAILED"
        })))
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let err = handler
        .scan(OP, &ScanOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ScanFailed(_)));
}

#[tokio::test]
async fn polling_times_out_and_reports_abandonment() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "QUEUED"
        })))
        .mount(&server)
        .await;

    let handler = handler_for(&server).with_poll_timing(
        Duration::from_millis(10),
        Duration::from_millis(25),
        Duration::from_millis(150),
    );
    let err = handler
        .scan(OP, &ScanOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
}

#[tokio::test]
async fn timeout_option_overrides_the_poll_deadline() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "QUEUED"
        })))
        .mount(&server)
        .await;

    // handler_for sets a 5s schedule; the per-scan option must win.
    let handler = handler_for(&server);
    let opts = ScanOptions {
        timeout: Some(1),
        ..Default::default()
    };
    let started = std::time::Instant::now();
    let err = handler
        .scan(OP, &opts, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn cancellation_stops_polling() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(put_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(status_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operation_status": "QUEUED"
        })))
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let err = handler
        .scan(OP, &ScanOptions::default(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted));
}

#[tokio::test]
async fn reports_can_be_fetched_by_image_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/v1/orgs/{ORG}/analyzer/image_id/sha256:cfg/vulnerabilities"
        )))
        .and(query_param("full_tag", TAG))
        .respond_with(scanned_report())
        .expect(1)
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let report = handler
        .fetch_report_by_image_id("sha256:cfg", TAG)
        .await
        .unwrap();
    assert_eq!(report.image_id, "sha256:cfg");
    assert_eq!(report.scan_status, "SCANNED");
}

#[tokio::test]
async fn health_check_maps_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/orgs/{ORG}/analyzer/health")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let handler = handler_for(&server);
    let err = handler.health_check().await.unwrap_err();
    assert!(matches!(err, Error::HttpNotFound));
}
