//! Concurrent validation of Kubernetes manifests against backend policy.
//!
//! The pipeline has three stages connected by bounded queues: a blocking
//! producer that walks the manifest path and splits YAML documents into
//! jobs, a pool of consumers that each call the validator endpoint, and an
//! aggregator that folds finished jobs into a [`ValidatedResources`].

pub mod job;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine};
use reqwest::Method;
use serde_yaml::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::client::{base_api_path, encode_query, try_read_error_response, ApiSession};
use crate::errors::{Error, Result};
use crate::events::ProgressSink;
use crate::resource::{ResourceError, ValidatedResource, ValidatedResources};

pub use job::Job;

const YAML_SEPARATOR: &str = "\n---";
const NUM_CONSUMERS: usize = 50;
const QUEUE_DEPTH: usize = 64;
const STDIN_PATH: &str = "STDIN";

#[derive(Clone)]
pub struct ResourceValidator {
    session: ApiSession,
    base_path: String,
    build_step: String,
    namespace: String,
}

impl ResourceValidator {
    pub fn new(
        session: ApiSession,
        saas_url: &str,
        org_key: &str,
        build_step: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            session,
            base_path: base_api_path(saas_url, org_key),
            build_step: build_step.into(),
            namespace: namespace.into(),
        }
    }

    /// Validate every YAML document under `path` (`-` reads stdin).
    ///
    /// Individual document failures become entries in the result's `errors`;
    /// only input-level problems (no YAML files, unreadable stdin) fail the
    /// whole call.
    pub async fn validate(
        &self,
        path: &str,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<ValidatedResources> {
        sink.stage("Validating Kubernetes resources");

        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let (done_tx, done_rx) = mpsc::channel::<Job>(QUEUE_DEPTH);

        let producer_path = path.to_string();
        let producer =
            tokio::task::spawn_blocking(move || produce_jobs(&producer_path, jobs_tx));

        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let mut consumers = JoinSet::new();
        for _ in 0..NUM_CONSUMERS {
            let validator = self.clone();
            let jobs_rx = Arc::clone(&jobs_rx);
            let done_tx = done_tx.clone();
            consumers.spawn(async move {
                loop {
                    let job = { jobs_rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let job = validator.process(job).await;
                    if done_tx.send(job).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        let aggregator = tokio::spawn(aggregate(done_rx));

        while consumers.join_next().await.is_some() {}
        let results = aggregator
            .await
            .map_err(|e| Error::ValidateFailed(format!("aggregation task failed: {e}")))?;
        producer
            .await
            .map_err(|e| Error::ValidateFailed(format!("producer task failed: {e}")))??;

        sink.completed();
        Ok(results)
    }

    async fn process(&self, mut job: Job) -> Job {
        if job.error.is_some() {
            return job;
        }
        if self.build_step.is_empty() {
            job.error = Some("build step must not be empty".to_string());
            return job;
        }
        let url = format!(
            "{}/guardrails/validator/{}/resource?namespace={}",
            self.base_path,
            self.build_step,
            encode_query(&self.namespace)
        );
        // The backend takes the document as raw bytes, which ride the JSON
        // envelope base64-encoded.
        let payload = serde_json::json!({
            "resource_data": general_purpose::STANDARD.encode(job.resource_data.as_bytes()),
        });
        match self
            .session
            .request_data(Method::POST, &url, Some(&payload))
            .await
        {
            Ok((_, body)) => match serde_json::from_slice(&body) {
                Ok(response) => job.result = Some(response),
                Err(err) => {
                    job.error = Some(format!("malformed validator response: {err}"));
                }
            },
            Err(Error::HttpUnsuccessful { status, body }) => {
                let message = try_read_error_response(&body)
                    .unwrap_or_else(|| format!("unsuccessful {status} response"));
                job.error = Some(message);
            }
            Err(err) => {
                warn!(file = %job.file_path, error = %err, "validation request failed");
                job.error = Some(err.to_string());
            }
        }
        job
    }
}

async fn aggregate(mut done_rx: mpsc::Receiver<Job>) -> ValidatedResources {
    let mut results = ValidatedResources::default();
    while let Some(job) = done_rx.recv().await {
        if let Some(error) = job.error {
            results.errors.push(ResourceError {
                file_path: job.file_path,
                error,
            });
        } else if let Some(response) = job.result {
            results.violated_resources.push(ValidatedResource {
                scope: response.scope,
                file_path: job.file_path,
                policy: response.policy,
                policy_violations: response.policy_violations,
            });
        }
    }
    results
}

fn produce_jobs(path: &str, jobs_tx: mpsc::Sender<Job>) -> Result<()> {
    if path == "-" {
        let mut content = String::new();
        std::io::stdin().read_to_string(&mut content)?;
        send_documents(&content, STDIN_PATH, &jobs_tx);
        return Ok(());
    }

    check_files_amount(path)?;
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_yaml(entry.path()) {
            continue;
        }
        let file_path = entry.path().display().to_string();
        match std::fs::read_to_string(entry.path()) {
            Ok(content) => send_documents(&content, &file_path, &jobs_tx),
            Err(err) => {
                let _ = jobs_tx.blocking_send(Job::with_error(
                    file_path,
                    format!("failed to read file: {err}"),
                ));
            }
        }
    }
    Ok(())
}

fn send_documents(content: &str, file_path: &str, jobs_tx: &mpsc::Sender<Job>) {
    for document in content.split(YAML_SEPARATOR) {
        if document.trim().is_empty() {
            continue;
        }
        // Parse only to reject malformed documents; the job keeps the raw
        // text so the backend sees the document byte for byte.
        let job = match serde_yaml::from_str::<Value>(document) {
            Ok(Value::Null) => continue,
            Ok(_) => Job::new(document, file_path),
            Err(err) => Job::with_error(file_path, format!("invalid yaml document: {err}")),
        };
        if jobs_tx.blocking_send(job).is_err() {
            // Receiver gone; the pipeline is shutting down.
            return;
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Fail fast when the path holds nothing to validate.
fn check_files_amount(path: &str) -> Result<()> {
    let count = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_yaml(e.path()))
        .count();
    debug!(path, count, "counted yaml files");
    if count == 0 {
        return Err(Error::ValidateFailed(format!(
            "no yaml files found under {path}"
        )));
    }
    Ok(())
}
