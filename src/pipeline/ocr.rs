//! OCR path: stage the document, run an external OCR job, collect its blocks.
//!
//! Two collaborators sit behind traits:
//!
//! * [`ObjectStore`]: bucket-scoped blob upload/delete used as the staging
//!   area the OCR service reads from.
//! * [`OcrService`]: `submit` a staged object, then `poll` the job until it
//!   leaves the running state, following `next_page_token` to collect all
//!   result pages.
//!
//! [`OcrPipeline`] drives them. The staging bucket is ensured once in
//! [`OcrPipeline::connect`] and then held as plain configuration; an
//! "already exists" answer from the store counts as success, so concurrent
//! processes never need to coordinate.
//!
//! Polling is bounded by a deadline. The local temporary copy of the
//! document is a [`tempfile::NamedTempFile`], so it is removed on every exit
//! path, including when the caller drops the future mid-poll.

use crate::config::OcrSettings;
use crate::error::PolicyCheckError;
use crate::pipeline::geometry::TextBlock;
use crate::pipeline::input::SourceDocument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of every staged object key.
pub const STAGING_PREFIX: &str = "documents";

// ── Collaborator contracts ───────────────────────────────────────────────────

/// Failure reported by an [`ObjectStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket already exists")]
    AlreadyExists,
    #[error("{0}")]
    Other(String),
}

/// Bucket-scoped blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;
    async fn upload(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError>;
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

/// State of an OCR job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[serde(alias = "IN_PROGRESS")]
    Running,
    Succeeded,
    Failed,
}

/// One poll result: the job status plus, once finished, a page of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPage {
    pub status: JobStatus,
    #[serde(default)]
    pub blocks: Vec<TextBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

/// An asynchronous OCR service reading from the staging store.
#[async_trait]
pub trait OcrService: Send + Sync {
    /// Start a job for a staged object; returns its job id.
    async fn submit(&self, bucket: &str, key: &str) -> Result<String, PolicyCheckError>;

    /// Status and result page of a job. `next_token` selects a later page.
    async fn poll(&self, job_id: &str, next_token: Option<&str>) -> Result<OcrPage, PolicyCheckError>;
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Stages documents, runs OCR jobs and gathers their blocks.
pub struct OcrPipeline {
    store: Arc<dyn ObjectStore>,
    service: Arc<dyn OcrService>,
    bucket: String,
    poll_interval: Duration,
    deadline: Duration,
}

impl std::fmt::Debug for OcrPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrPipeline")
            .field("bucket", &self.bucket)
            .field("poll_interval", &self.poll_interval)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl OcrPipeline {
    /// Ensure the staging bucket exists, then build the pipeline.
    pub async fn connect(
        store: Arc<dyn ObjectStore>,
        service: Arc<dyn OcrService>,
        settings: &OcrSettings,
    ) -> Result<Self, PolicyCheckError> {
        ensure_bucket(store.as_ref(), &settings.bucket).await?;
        Ok(Self::new(
            store,
            service,
            settings.bucket.clone(),
            Duration::from_secs(settings.poll_interval_secs),
            Duration::from_secs(settings.timeout_secs),
        ))
    }

    /// Build without touching the store; the bucket must already exist.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        service: Arc<dyn OcrService>,
        bucket: impl Into<String>,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            service,
            bucket: bucket.into(),
            poll_interval,
            deadline,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Run OCR on one document and return every block of every result page.
    pub async fn recognize(&self, doc: &SourceDocument) -> Result<Vec<TextBlock>, PolicyCheckError> {
        let staged = tempfile::Builder::new()
            .prefix("policycheck-")
            .tempfile()
            .map_err(|e| PolicyCheckError::Internal(format!("Failed to create temp file: {}", e)))?;
        tokio::fs::write(staged.path(), doc.bytes())
            .await
            .map_err(|e| PolicyCheckError::Internal(format!("Failed to write temp file: {}", e)))?;

        let key = staging_key(doc.name());
        self.store
            .upload(&self.bucket, &key, staged.path())
            .await
            .map_err(|e| PolicyCheckError::service("storage", e))?;
        debug!("Staged '{}' as {}/{}", doc.name(), self.bucket, key);

        let result = self.run_job(&key).await;

        if let Err(e) = self.store.delete(&self.bucket, &key).await {
            warn!("Failed to delete staged object {}/{}: {}", self.bucket, key, e);
        }
        result
    }

    async fn run_job(&self, key: &str) -> Result<Vec<TextBlock>, PolicyCheckError> {
        let job_id = self.service.submit(&self.bucket, key).await?;
        info!("OCR job {} started", job_id);

        match timeout(self.deadline, self.collect(&job_id)).await {
            Ok(result) => result,
            Err(_) => Err(PolicyCheckError::OcrTimeout {
                job_id,
                secs: self.deadline.as_secs(),
            }),
        }
    }

    async fn collect(&self, job_id: &str) -> Result<Vec<TextBlock>, PolicyCheckError> {
        let first = loop {
            let page = self.service.poll(job_id, None).await?;
            match page.status {
                JobStatus::Running => sleep(self.poll_interval).await,
                JobStatus::Failed => {
                    return Err(PolicyCheckError::OcrJobFailure {
                        job_id: job_id.to_string(),
                        message: page
                            .status_message
                            .unwrap_or_else(|| "no status message".to_string()),
                    })
                }
                JobStatus::Succeeded => break page,
            }
        };

        let mut blocks = first.blocks;
        let mut token = first.next_page_token;
        let mut pages = 1;
        while let Some(t) = token {
            let next = self.service.poll(job_id, Some(&t)).await?;
            blocks.extend(next.blocks);
            token = next.next_page_token;
            pages += 1;
        }
        info!("OCR job {} finished: {} block(s) in {} result page(s)", job_id, blocks.len(), pages);
        Ok(blocks)
    }
}

/// Create `bucket`, treating "already exists" as success.
pub async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<(), PolicyCheckError> {
    match store.create_bucket(bucket).await {
        Ok(()) => {
            info!("Created staging bucket {}", bucket);
            Ok(())
        }
        Err(StoreError::AlreadyExists) => {
            debug!("Staging bucket {} already exists", bucket);
            Ok(())
        }
        Err(e) => Err(PolicyCheckError::service("storage", e)),
    }
}

/// `documents/<uuid>/<file name>`.
pub fn staging_key(name: &str) -> String {
    format!("{}/{}/{}", STAGING_PREFIX, Uuid::new_v4(), name)
}

// ── Local-directory object store ─────────────────────────────────────────────

/// [`ObjectStore`] over a local directory: buckets are subdirectories.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let dir = self.root.join(bucket);
        if tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(StoreError::AlreadyExists);
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))
    }

    async fn upload(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError> {
        let target = self.object_path(bucket, key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Other(e.to_string()))?;
        }
        tokio::fs::copy(source, &target)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Other(e.to_string()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let target = self.object_path(bucket, key);
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        if let Some(parent) = target.parent() {
            // Leftover per-document directory; ignore if something else is in it.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

// ── HTTP OCR service ─────────────────────────────────────────────────────────

/// [`OcrService`] speaking JSON over HTTP.
///
/// * `POST {endpoint}/jobs` with `{"bucket": …, "key": …}` → `{"job_id": …}`
/// * `GET {endpoint}/jobs/{job_id}[?next_token=…]` → an [`OcrPage`]
#[derive(Debug, Clone)]
pub struct HttpOcrService {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    bucket: &'a str,
    key: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

impl HttpOcrService {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self, PolicyCheckError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PolicyCheckError::service("ocr", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Vec<u8>, PolicyCheckError> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| PolicyCheckError::service("ocr", e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| PolicyCheckError::service("ocr", e))?;
        if !status.is_success() {
            return Err(PolicyCheckError::service(
                "ocr",
                format!(
                    "HTTP {}: {}",
                    status,
                    crate::error::excerpt(&String::from_utf8_lossy(&body))
                ),
            ));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl OcrService for HttpOcrService {
    async fn submit(&self, bucket: &str, key: &str) -> Result<String, PolicyCheckError> {
        let payload = serde_json::to_vec(&SubmitRequest { bucket, key })
            .map_err(|e| PolicyCheckError::Internal(e.to_string()))?;
        let req = self
            .client
            .post(format!("{}/jobs", self.endpoint))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        let body = self.send(req).await?;
        let parsed: SubmitResponse = serde_json::from_slice(&body)
            .map_err(|e| PolicyCheckError::service("ocr", format!("bad submit response: {}", e)))?;
        Ok(parsed.job_id)
    }

    async fn poll(&self, job_id: &str, next_token: Option<&str>) -> Result<OcrPage, PolicyCheckError> {
        let base = format!("{}/jobs/{}", self.endpoint, job_id);
        let url = match next_token {
            Some(t) => reqwest::Url::parse_with_params(&base, &[("next_token", t)]),
            None => reqwest::Url::parse(&base),
        }
        .map_err(|e| PolicyCheckError::service("ocr", format!("bad endpoint URL: {}", e)))?;
        let body = self.send(self.client.get(url)).await?;
        serde_json::from_slice(&body)
            .map_err(|e| PolicyCheckError::service("ocr", format!("bad poll response: {}", e)))
    }
}
