//! Typed bindings to the remote OCR service.
//!
//! This module is intentionally thin: one method per wire operation, no
//! retries, no recovery logic — retry and fallback policy live in
//! [`crate::acquire`]. The [`DocumentService`] trait is the seam the rest of
//! the crate programs against; [`RemoteClient`] is the production
//! implementation, and tests substitute an in-memory service.
//!
//! ## Wire shapes
//!
//! The request and response shapes here are the service's, not ours:
//! submission is a multipart upload (`file` + `options_json`), status is a
//! small JSON record, and the stream endpoint publishes newline-delimited
//! JSON page events whose delivery order is not guaranteed. A stream is not
//! restartable — each `open_stream` call opens a fresh connection with no
//! replay of earlier events.

use crate::config::{OutputFormat, SubmitOptions};
use crate::error::OcrError;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;
use tracing::{debug, warn};

/// Default API root; override via [`RemoteClient::with_base_url`].
pub const DEFAULT_BASE_URL: &str = "https://api.mathpix.com/v3";

/// API credentials, sent as `app_id` / `app_key` headers on every request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub app_id: String,
    pub app_key: String,
}

impl Credentials {
    /// Read credentials from `MATHPIX_APP_ID` / `MATHPIX_APP_KEY`.
    pub fn from_env() -> Result<Self, OcrError> {
        let app_id = std::env::var("MATHPIX_APP_ID").unwrap_or_default();
        let app_key = std::env::var("MATHPIX_APP_KEY").unwrap_or_default();
        if app_id.is_empty() || app_key.is_empty() {
            return Err(OcrError::InvalidConfig(
                "Set MATHPIX_APP_ID and MATHPIX_APP_KEY in the environment".into(),
            ));
        }
        Ok(Self { app_id, app_key })
    }
}

/// Opaque handle identifying one submitted document's processing job.
///
/// Created by [`DocumentService::submit`]; immutable; owned by exactly one
/// acquisition for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub tracking_id: String,
    pub submitted_at: DateTime<Utc>,
}

/// One unit of streamed partial result.
///
/// `page_idx` is 1-indexed; `total_selected` is the number of pages the
/// service selected for processing (0 until the service knows it).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageEvent {
    #[serde(rename = "page_idx")]
    pub page_idx: usize,
    #[serde(rename = "pdf_selected_len", default)]
    pub total_selected: usize,
    #[serde(default)]
    pub text: String,
}

/// Server-side processing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessingStatus {
    Received,
    Loaded,
    Split,
    Completed,
    Error,
    /// A status string the bindings do not recognise; kept verbatim so the
    /// polling loop can log it and keep waiting.
    Other(String),
}

impl From<String> for ProcessingStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "received" => ProcessingStatus::Received,
            "loaded" => ProcessingStatus::Loaded,
            "split" => ProcessingStatus::Split,
            "completed" => ProcessingStatus::Completed,
            "error" => ProcessingStatus::Error,
            _ => ProcessingStatus::Other(s),
        }
    }
}

impl From<ProcessingStatus> for String {
    fn from(s: ProcessingStatus) -> Self {
        match s {
            ProcessingStatus::Received => "received".into(),
            ProcessingStatus::Loaded => "loaded".into(),
            ProcessingStatus::Split => "split".into(),
            ProcessingStatus::Completed => "completed".into(),
            ProcessingStatus::Error => "error".into(),
            ProcessingStatus::Other(s) => s,
        }
    }
}

/// Response of a status poll.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: ProcessingStatus,
    #[serde(default)]
    pub num_pages: usize,
    #[serde(default)]
    pub num_pages_completed: usize,
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Query for [`DocumentService::list_documents`].
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u32,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 50,
            from_date: None,
            to_date: None,
        }
    }
}

/// One server-side document record.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    #[serde(default)]
    pub input_file: String,
    #[serde(default)]
    pub status: Option<ProcessingStatus>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub num_pages: usize,
    #[serde(default)]
    pub num_pages_completed: usize,
}

/// Page of server-side document records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentList {
    #[serde(default)]
    pub pdfs: Vec<DocumentRecord>,
}

/// A boxed stream of page events; infinite until the server closes the
/// connection or the network fails.
pub type PageEventStream = Pin<Box<dyn Stream<Item = Result<PageEvent, OcrError>> + Send>>;

/// The seam between the pipeline and the remote service.
///
/// Each method is a single network round trip (or one long-lived stream)
/// with no side effects beyond the call itself.
#[async_trait::async_trait]
pub trait DocumentService: Send + Sync {
    /// Upload a document for processing.
    async fn submit(
        &self,
        document: &Path,
        options: &SubmitOptions,
    ) -> Result<SubmissionHandle, OcrError>;

    /// Open the page-event stream for a submission. Each call opens a new
    /// connection; events already published are not replayed.
    async fn open_stream(&self, handle: &SubmissionHandle) -> Result<PageEventStream, OcrError>;

    /// Query processing status.
    async fn poll_status(&self, handle: &SubmissionHandle) -> Result<StatusResponse, OcrError>;

    /// Download the complete output in the named format.
    async fn download(
        &self,
        handle: &SubmissionHandle,
        format: OutputFormat,
    ) -> Result<Vec<u8>, OcrError>;

    /// Fetch one CDN-hosted asset referenced from output content.
    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, OcrError>;

    /// Remove server-side state for a submission.
    async fn delete_result(&self, handle: &SubmissionHandle) -> Result<(), OcrError>;

    /// List documents stored on the server.
    async fn list_documents(&self, query: &ListQuery) -> Result<DocumentList, OcrError>;
}

// ── Production implementation ────────────────────────────────────────────

/// Per-operation timeouts for [`RemoteClient`].
#[derive(Debug, Clone)]
pub struct ClientTimeouts {
    pub submit: Duration,
    pub status: Duration,
    pub stream: Duration,
    pub download: Duration,
    pub asset: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            submit: Duration::from_secs(120),
            status: Duration::from_secs(30),
            stream: Duration::from_secs(300),
            download: Duration::from_secs(60),
            asset: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed [`DocumentService`] implementation.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    auth: HeaderMap,
    timeouts: ClientTimeouts,
}

impl RemoteClient {
    pub fn new(credentials: Credentials) -> Result<Self, OcrError> {
        Self::with_base_url(credentials, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(credentials: Credentials, base_url: &str) -> Result<Self, OcrError> {
        let mut auth = HeaderMap::new();
        auth.insert(
            "app_id",
            HeaderValue::from_str(&credentials.app_id)
                .map_err(|_| OcrError::InvalidConfig("app_id is not a valid header value".into()))?,
        );
        auth.insert(
            "app_key",
            HeaderValue::from_str(&credentials.app_key).map_err(|_| {
                OcrError::InvalidConfig("app_key is not a valid header value".into())
            })?,
        );

        let http = reqwest::Client::builder()
            .build()
            .map_err(OcrError::transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            timeouts: ClientTimeouts::default(),
        })
    }

    pub fn timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn pdf_url(&self, tail: &str) -> String {
        format!("{}/pdf{}", self.base_url, tail)
    }

    /// Map a non-success HTTP response to the matching error.
    ///
    /// 4xx means the service understood and declined the request; the body's
    /// structured code is surfaced verbatim. 5xx is treated as transport.
    async fn error_from_response(resp: reqwest::Response) -> OcrError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return OcrError::NotFound {
                tracking_id: String::new(),
            };
        }
        if status.is_client_error() {
            let (code, detail) = parse_rejection(&body);
            return OcrError::Rejected { code, detail };
        }
        OcrError::Transport {
            detail: format!("HTTP {status}: {body}"),
        }
    }
}

/// Extract the structured `(code, message)` pair from a rejection body.
fn parse_rejection(body: &str) -> (String, String) {
    #[derive(Deserialize)]
    struct ErrorInfo {
        #[serde(default)]
        id: String,
    }
    #[derive(Deserialize)]
    struct Rejection {
        #[serde(default)]
        error: String,
        #[serde(default)]
        error_info: Option<ErrorInfo>,
    }
    match serde_json::from_str::<Rejection>(body) {
        Ok(r) => {
            let code = r
                .error_info
                .map(|i| i.id)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            let detail = if r.error.is_empty() {
                body.to_string()
            } else {
                r.error
            };
            (code, detail)
        }
        Err(_) => ("unknown".to_string(), body.to_string()),
    }
}

#[async_trait::async_trait]
impl DocumentService for RemoteClient {
    async fn submit(
        &self,
        document: &Path,
        options: &SubmitOptions,
    ) -> Result<SubmissionHandle, OcrError> {
        let bytes = tokio::fs::read(document).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OcrError::FileNotFound {
                path: document.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => OcrError::PermissionDenied {
                path: document.to_path_buf(),
            },
            _ => OcrError::Internal(format!("reading {}: {e}", document.display())),
        })?;

        let filename = document
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document.pdf".to_string());

        let options_json = serde_json::to_string(options)
            .map_err(|e| OcrError::Internal(format!("encoding submit options: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(filename.clone()),
            )
            .text("options_json", options_json);

        debug!("Submitting {filename}");
        let resp = self
            .http
            .post(self.pdf_url(""))
            .headers(self.auth.clone())
            .multipart(form)
            .timeout(self.timeouts.submit)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        #[derive(Deserialize)]
        struct SubmitResponse {
            #[serde(default)]
            pdf_id: String,
            #[serde(default)]
            error: String,
            #[serde(default)]
            error_info: Option<serde_json::Value>,
        }

        let body: SubmitResponse = resp.json().await.map_err(|e| OcrError::UnexpectedResponse {
            detail: format!("submit response: {e}"),
        })?;

        // The service can answer 200 with a structured rejection.
        if body.pdf_id.is_empty() {
            let code = body
                .error_info
                .as_ref()
                .and_then(|i| i.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(OcrError::Rejected {
                code,
                detail: body.error,
            });
        }

        debug!("Submitted {filename} → tracking id {}", body.pdf_id);
        Ok(SubmissionHandle {
            tracking_id: body.pdf_id,
            submitted_at: Utc::now(),
        })
    }

    async fn open_stream(&self, handle: &SubmissionHandle) -> Result<PageEventStream, OcrError> {
        let url = self.pdf_url(&format!("/{}/stream", handle.tracking_id));
        debug!("Opening stream {url}");
        let resp = self
            .http
            .get(&url)
            .headers(self.auth.clone())
            .timeout(self.timeouts.stream)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let bytes = resp.bytes_stream().map(|r| r.map_err(OcrError::transport));
        Ok(page_event_stream(bytes))
    }

    async fn poll_status(&self, handle: &SubmissionHandle) -> Result<StatusResponse, OcrError> {
        let resp = self
            .http
            .get(self.pdf_url(&format!("/{}", handle.tracking_id)))
            .headers(self.auth.clone())
            .timeout(self.timeouts.status)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if !resp.status().is_success() {
            return Err(match Self::error_from_response(resp).await {
                OcrError::NotFound { .. } => OcrError::NotFound {
                    tracking_id: handle.tracking_id.clone(),
                },
                other => other,
            });
        }

        resp.json().await.map_err(|e| OcrError::UnexpectedResponse {
            detail: format!("status response: {e}"),
        })
    }

    async fn download(
        &self,
        handle: &SubmissionHandle,
        format: OutputFormat,
    ) -> Result<Vec<u8>, OcrError> {
        let url = self.pdf_url(&format!("/{}.{}", handle.tracking_id, format.extension()));
        debug!("Downloading {url}");
        let resp = self
            .http
            .get(&url)
            .headers(self.auth.clone())
            .timeout(self.timeouts.download)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if !resp.status().is_success() {
            return Err(match Self::error_from_response(resp).await {
                OcrError::NotFound { .. } => OcrError::NotFound {
                    tracking_id: handle.tracking_id.clone(),
                },
                other => other,
            });
        }

        Ok(resp
            .bytes()
            .await
            .map_err(OcrError::transport)?
            .to_vec())
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, OcrError> {
        // CDN assets need no auth headers.
        let resp = self
            .http
            .get(url)
            .timeout(self.timeouts.asset)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if !resp.status().is_success() {
            return Err(OcrError::Transport {
                detail: format!("HTTP {} fetching {url}", resp.status()),
            });
        }

        Ok(resp
            .bytes()
            .await
            .map_err(OcrError::transport)?
            .to_vec())
    }

    async fn delete_result(&self, handle: &SubmissionHandle) -> Result<(), OcrError> {
        let resp = self
            .http
            .delete(self.pdf_url(&format!("/{}", handle.tracking_id)))
            .headers(self.auth.clone())
            .timeout(self.timeouts.status)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OcrError::NotFound {
                tracking_id: handle.tracking_id.clone(),
            });
        }
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        Ok(())
    }

    async fn list_documents(&self, query: &ListQuery) -> Result<DocumentList, OcrError> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", query.page.to_string()),
            ("per_page", query.per_page.to_string()),
        ];
        if let Some(from) = query.from_date {
            params.push(("from_date", from.to_rfc3339()));
        }
        if let Some(to) = query.to_date {
            params.push(("to_date", to.to_rfc3339()));
        }

        let resp = self
            .http
            .get(format!("{}/pdf-results", self.base_url))
            .headers(self.auth.clone())
            .query(&params)
            .timeout(self.timeouts.status)
            .send()
            .await
            .map_err(OcrError::transport)?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        resp.json().await.map_err(|e| OcrError::UnexpectedResponse {
            detail: format!("list response: {e}"),
        })
    }
}

// ── Stream decoding ──────────────────────────────────────────────────────

/// Decode a raw byte stream into page events, splitting on newlines.
///
/// A malformed line is logged and skipped rather than terminating the
/// stream: the service occasionally emits keep-alive or diagnostic lines the
/// bindings do not model, and losing the rest of the document over one of
/// those would be worse than ignoring it.
pub(crate) fn page_event_stream<S, C>(bytes: S) -> PageEventStream
where
    S: Stream<Item = Result<C, OcrError>> + Send + 'static,
    C: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    let stream = futures::stream::try_unfold(state, |(mut bytes, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(event) = decode_event_line(&raw) {
                    return Ok(Some((event, (bytes, buf, done))));
                }
                continue;
            }

            if done {
                // Flush a trailing line that arrived without a newline.
                if !buf.is_empty() {
                    let raw = std::mem::take(&mut buf);
                    if let Some(event) = decode_event_line(&raw) {
                        return Ok(Some((event, (bytes, buf, done))));
                    }
                }
                return Ok(None);
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Err(e),
                None => done = true,
            }
        }
    });
    Box::pin(stream)
}

fn decode_event_line(raw: &[u8]) -> Option<PageEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<PageEvent>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping undecodable stream line ({e}): {:.100}", line);
            None
        }
    }
}
