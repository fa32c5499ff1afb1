use std::fs;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keelscan::client::ApiSession;
use keelscan::errors::Error;
use keelscan::events::NullSink;
use keelscan::validate::ResourceValidator;

const ORG: &str = "TESTORG";

fn validator_for(server: &MockServer, build_step: &str) -> ResourceValidator {
    let session = ApiSession::new("access-id", "access-key").unwrap();
    ResourceValidator::new(session, &server.uri(), ORG, build_step, "default")
}

fn validator_path(build_step: &str) -> String {
    format!("/v1/orgs/{ORG}/guardrails/validator/{build_step}/resource")
}

fn violation_response(policy: &str, violations: usize) -> ResponseTemplate {
    let violations: Vec<_> = (0..violations)
        .map(|i| json!({"rule": format!("rule-{i}"), "risk": "HIGH", "violation": {}}))
        .collect();
    ResponseTemplate::new(200).set_body_json(json!({
        "kind": "Deployment",
        "name": "web",
        "namespace": "default",
        "labels": {},
        "policy": policy,
        "policy_violations": violations,
    }))
}

#[tokio::test]
async fn every_document_becomes_one_validation_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(validator_path("DEPLOY")))
        .and(query_param("namespace", "default"))
        .respond_with(violation_response("baseline", 1))
        .expect(4)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("deploy.yaml"), "kind: Deployment\nname: web\n").unwrap();
    fs::write(dir.path().join("svc.yml"), "kind: Service\nname: web\n").unwrap();
    fs::write(
        dir.path().join("bundle.yaml"),
        "kind: ConfigMap\nname: a\n---\nkind: Secret\nname: b\n",
    )
    .unwrap();
    fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();

    let validator = validator_for(&server, "DEPLOY");
    let results = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap();

    assert!(results.errors.is_empty());
    assert_eq!(results.violated_resources.len(), 4);
    let by_policy = results.to_by_policy();
    assert_eq!(by_policy.policy_violations_count(), 4);
    for resource in &by_policy.policies["baseline"] {
        assert!(resource.file_path.starts_with(&dir.path().display().to_string()));
    }
}

#[tokio::test]
async fn malformed_documents_fail_alone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(validator_path("DEPLOY")))
        .respond_with(violation_response("baseline", 0))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("mixed.yaml"),
        "kind: Pod\nname: ok\n---\nkind: [unclosed\n",
    )
    .unwrap();

    let validator = validator_for(&server, "DEPLOY");
    let results = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].error.contains("invalid yaml document"));
    assert_eq!(results.violated_resources.len(), 1);
}

#[tokio::test]
async fn directories_without_yaml_fail_the_whole_call() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("readme.md"), "# nothing to validate").unwrap();

    let validator = validator_for(&server, "DEPLOY");
    let err = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ValidateFailed(_)));
}

#[tokio::test]
async fn empty_build_step_errors_every_job_without_calling_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(validator_path("")))
        .respond_with(violation_response("baseline", 0))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("deploy.yaml"), "kind: Deployment\n").unwrap();

    let validator = validator_for(&server, "");
    let results = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].error.contains("build step"));
    assert!(results.violated_resources.is_empty());
}

#[tokio::test]
async fn backend_rejections_surface_their_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(validator_path("DEPLOY")))
        .and(body_partial_json(json!({
            "resource_data": general_purpose::STANDARD.encode("kind: Pod\n")
        })))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"message": "unknown kind"})),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pod.yaml"), "kind: Pod\n").unwrap();

    let validator = validator_for(&server, "DEPLOY");
    let results = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(results.errors.len(), 1);
    assert_eq!(results.errors[0].error, "unknown kind");
}

#[tokio::test]
async fn documents_travel_as_their_original_bytes() {
    let server = MockServer::start().await;
    // Anchors and key order would not survive a YAML-to-JSON round trip;
    // the backend must receive the author's bytes.
    let document = "zeta: 1\nmetadata: &shared\n  team: sre\nspec: *shared\n";
    Mock::given(method("POST"))
        .and(path(validator_path("DEPLOY")))
        .and(wiremock::matchers::body_json(json!({
            "resource_data": general_purpose::STANDARD.encode(document)
        })))
        .respond_with(violation_response("baseline", 1))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("anchored.yaml"), document).unwrap();

    let validator = validator_for(&server, "DEPLOY");
    let results = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap();

    assert!(results.errors.is_empty());
    assert_eq!(results.violated_resources.len(), 1);
}

#[tokio::test]
async fn clean_resources_are_dropped_from_policy_grouping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(validator_path("DEPLOY")))
        .respond_with(violation_response("baseline", 0))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("deploy.yaml"), "kind: Deployment\n").unwrap();

    let validator = validator_for(&server, "DEPLOY");
    let results = validator
        .validate(&dir.path().display().to_string(), Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(results.violated_resources.len(), 1);
    let by_policy = results.to_by_policy();
    assert!(by_policy.policies.is_empty());
    assert_eq!(by_policy.policy_violations_count(), 0);
}
