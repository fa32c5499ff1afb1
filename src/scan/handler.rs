//! Scan submission and status polling against the backend analyzer.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{base_api_path, encode_query, ApiSession};
use crate::errors::{Error, Result};
use crate::events::ProgressSink;
use crate::scan::bom::Bom;
use crate::scan::layers::LayerRecord;
use crate::scan::ScanOptions;

const DEFAULT_POLL_PAUSE: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POLL_DURATION: Duration = Duration::from_secs(600);

/// Backend-reported state of a scan operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Uploaded,
    Queued,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StatusResponse {
    #[serde(default)]
    pub operation_status: Option<Status>,
}

/// Final scan report returned by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScannedImage {
    #[serde(default)]
    pub manifest_digest: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub full_tag: String,
    #[serde(default)]
    pub scan_status: String,
    #[serde(default)]
    pub vulnerabilities: Value,
}

#[derive(Serialize)]
struct ScanRequest<'a> {
    sbom: &'a Value,
    layers: &'a [LayerRecord],
    build_step: &'a str,
    namespace: &'a str,
    force_scan: bool,
    image_id: &'a str,
    metadata: ScanMetadata<'a>,
}

#[derive(Serialize)]
struct ScanMetadata<'a> {
    syft_version: &'a str,
    cli_version: &'a str,
}

/// Drives one image scan end to end: submit, poll, fetch report.
///
/// Cloneable so each poll tick can run on its own task; the session pools
/// connections and the sink is shared.
#[derive(Clone)]
pub struct ScanHandler {
    session: ApiSession,
    base_path: String,
    build_step: String,
    namespace: String,
    bom: Option<Bom>,
    layers: Vec<LayerRecord>,
    image_id: String,
    syft_version: String,
    poll_pause: Duration,
    poll_interval: Duration,
    poll_duration: Duration,
    sink: Arc<dyn ProgressSink>,
}

impl ScanHandler {
    pub fn new(
        session: ApiSession,
        saas_url: &str,
        org_key: &str,
        build_step: impl Into<String>,
        namespace: impl Into<String>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            session,
            base_path: base_api_path(saas_url, org_key),
            build_step: build_step.into(),
            namespace: namespace.into(),
            bom: None,
            layers: Vec::new(),
            image_id: String::new(),
            syft_version: String::new(),
            poll_pause: DEFAULT_POLL_PAUSE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_duration: DEFAULT_POLL_DURATION,
            sink,
        }
    }

    /// Override the polling schedule; tests use it. `ScanOptions::timeout`
    /// still wins over the duration set here.
    pub fn with_poll_timing(
        mut self,
        pause: Duration,
        interval: Duration,
        duration: Duration,
    ) -> Self {
        self.poll_pause = pause;
        self.poll_interval = interval;
        self.poll_duration = duration;
        self
    }

    /// Attach the generated artifacts before submitting.
    pub fn attach_data(
        &mut self,
        bom: Bom,
        layers: Vec<LayerRecord>,
        image_id: impl Into<String>,
        syft_version: impl Into<String>,
    ) {
        self.bom = Some(bom);
        self.layers = layers;
        self.image_id = image_id.into();
        self.syft_version = syft_version.into();
    }

    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/analyzer/health", self.base_path);
        self.session
            .request_data::<()>(Method::GET, &url, None)
            .await?;
        Ok(())
    }

    /// Run the scan to completion or a terminal error.
    ///
    /// Submits the artifacts, then polls on a fixed interval until the
    /// backend reports a terminal status, the deadline passes, or `cancel`
    /// fires. A failed status check abandons that tick and polling goes on;
    /// only backend-reported failure, timeout, or cancellation end the scan.
    pub async fn scan(
        &self,
        operation_id: &str,
        opts: &ScanOptions,
        cancel: CancellationToken,
    ) -> Result<ScannedImage> {
        let bom = self
            .bom
            .as_ref()
            .ok_or_else(|| Error::ScanFailed("no sbom attached to the scan".into()))?;

        self.sink.stage("Submitting image for analysis");
        let response = self.put_bom(operation_id, bom, opts).await?;
        if response.operation_status == Some(Status::Finished) {
            // Fresh submissions of an already scanned image come back
            // finished immediately; confirm before skipping the poll.
            let report = self.fetch_report(&bom.manifest_digest, &bom.full_tag).await?;
            if report.scan_status == "SCANNED" {
                info!(operation_id, "image already analyzed");
                return Ok(report);
            }
        }

        let poll_duration = opts
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.poll_duration);

        self.sink.stage("Waiting for analysis results");
        tokio::time::sleep(self.poll_pause).await;
        self.poll(operation_id, bom, cancel, poll_duration).await
    }

    async fn poll(
        &self,
        operation_id: &str,
        bom: &Bom,
        cancel: CancellationToken,
        poll_duration: Duration,
    ) -> Result<ScannedImage> {
        let (tx, mut rx) = mpsc::channel::<Option<Status>>(16);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        let deadline = tokio::time::sleep(poll_duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.send_cancel_notice(operation_id, bom).await;
                    return Err(Error::Timeout);
                }
                _ = cancel.cancelled() => {
                    self.send_cancel_notice(operation_id, bom).await;
                    return Err(Error::Interrupted);
                }
                _ = ticker.tick() => {
                    let handler = self.clone();
                    let op = operation_id.to_string();
                    let tag = bom.full_tag.clone();
                    let digest = bom.manifest_digest.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let status = match handler.fetch_status(&op, &digest, &tag).await {
                            Ok(status) => Some(status),
                            Err(err) => {
                                warn!(operation_id = %op, error = %err, "status check failed, will retry");
                                None
                            }
                        };
                        let _ = tx.send(status).await;
                    });
                }
                checked = rx.recv() => {
                    match checked.flatten() {
                        Some(Status::Finished) => {
                            return self.fetch_report(&bom.manifest_digest, &bom.full_tag).await;
                        }
                        Some(Status::Failed) => {
                            return Err(Error::ScanFailed("the analyzer reported the scan as failed".into()));
                        }
                        other => debug!(operation_id, status = ?other, "scan still in progress"),
                    }
                }
            }
        }
    }

    async fn put_bom(
        &self,
        operation_id: &str,
        bom: &Bom,
        opts: &ScanOptions,
    ) -> Result<StatusResponse> {
        let url = format!(
            "{}/analyzer/images/{}/operations/{}?full_tag={}&image_id={}",
            self.base_path,
            bom.manifest_digest,
            operation_id,
            encode_query(&bom.full_tag),
            encode_query(&self.image_id)
        );
        let request = ScanRequest {
            sbom: &bom.packages,
            layers: &self.layers,
            build_step: &self.build_step,
            namespace: &self.namespace,
            force_scan: opts.force_scan,
            image_id: &self.image_id,
            metadata: ScanMetadata {
                syft_version: &self.syft_version,
                cli_version: env!("CARGO_PKG_VERSION"),
            },
        };
        let (_, body) = self
            .session
            .request_data(Method::PUT, &url, Some(&request))
            .await?;
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }

    async fn fetch_status(
        &self,
        operation_id: &str,
        manifest_digest: &str,
        full_tag: &str,
    ) -> Result<Status> {
        let url = format!(
            "{}/analyzer/images/{}/operations/{}/status?full_tag={}",
            self.base_path,
            manifest_digest,
            operation_id,
            encode_query(full_tag)
        );
        match self.session.request_data::<()>(Method::GET, &url, None).await {
            Ok((_, body)) => {
                let response: StatusResponse =
                    serde_json::from_slice(&body).unwrap_or_default();
                Ok(response.operation_status.unwrap_or(Status::Queued))
            }
            // The operation record appears only once the backend picks the
            // scan up; treat its absence as still queued.
            Err(Error::HttpNotFound) => Ok(Status::Queued),
            Err(err) => Err(err),
        }
    }

    /// Fetch the vulnerability report by manifest digest.
    pub async fn fetch_report(&self, manifest_digest: &str, full_tag: &str) -> Result<ScannedImage> {
        let url = format!(
            "{}/analyzer/images/{}/vulnerabilities?full_tag={}",
            self.base_path,
            manifest_digest,
            encode_query(full_tag)
        );
        let (_, body) = self
            .session
            .request_data::<()>(Method::GET, &url, None)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::ScanFailed(format!("malformed scan report: {e}")))
    }

    /// Fetch the vulnerability report by image id, for images scanned under
    /// a different tag.
    pub async fn fetch_report_by_image_id(
        &self,
        image_id: &str,
        full_tag: &str,
    ) -> Result<ScannedImage> {
        let url = format!(
            "{}/analyzer/image_id/{}/vulnerabilities?full_tag={}",
            self.base_path,
            image_id,
            encode_query(full_tag)
        );
        let (_, body) = self
            .session
            .request_data::<()>(Method::GET, &url, None)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::ScanFailed(format!("malformed scan report: {e}")))
    }

    /// Best-effort notice that the client walked away from the operation.
    async fn send_cancel_notice(&self, operation_id: &str, bom: &Bom) {
        let url = format!(
            "{}/analyzer/images/{}/operations/{}?full_tag={}&image_id={}",
            self.base_path,
            bom.manifest_digest,
            operation_id,
            encode_query(&bom.full_tag),
            encode_query(&self.image_id)
        );
        let payload = serde_json::json!({"scan_status": "NOT_SCANNED"});
        if let Err(err) = self
            .session
            .request_data(Method::PUT, &url, Some(&payload))
            .await
        {
            warn!(operation_id, error = %err, "failed to report scan abandonment");
        }
    }
}
