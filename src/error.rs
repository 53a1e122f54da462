//! Error types for the ocr2md library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`OcrError`] — **Fatal for one document**: the pipeline for that input
//!   cannot produce a result (submission rejected, remote processing error,
//!   polling bound exceeded). Returned as `Err(OcrError)` from the per-stage
//!   functions and converted to a [`crate::output::BatchItemResult`] at the
//!   batch boundary, where it never aborts sibling pipelines.
//!
//! * [`crate::localize::AssetFailure`] — **Non-fatal**: a single remote asset
//!   could not be fetched. Recorded in the localization report; the document
//!   is still written with every other reference rewritten.
//!
//! Missing pages after a best-effort streaming run are a *warning*
//! (`missing_pages` on [`crate::output::AcquiredDocument`]), not an error —
//! partial output is still useful.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal per-document errors returned by the ocr2md library.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    // ── Remote service errors ─────────────────────────────────────────────
    /// Network-level failure: DNS, connect, TLS, read timeout, dropped
    /// connection. Retryable at the polling layer, never mid-stream.
    #[error("Transport error talking to the OCR service: {detail}")]
    Transport { detail: String },

    /// The service declined the input. `code` is the service's structured
    /// error identifier, passed through verbatim (e.g. unsupported file,
    /// encrypted file, page-limit exceeded). Never retried.
    #[error("Submission rejected by the OCR service ({code}): {detail}")]
    Rejected { code: String, detail: String },

    /// The service reported `status = error` after processing started.
    #[error("Remote processing failed: {detail}")]
    Remote { detail: String },

    /// Polling exceeded the configured wait bound while the status stayed
    /// non-terminal.
    #[error("Timed out after {waited_secs}s waiting for the OCR service to complete.\nIncrease --max-wait or check the service status page.")]
    Timeout { waited_secs: u64 },

    /// The tracking identifier is unknown to the service (already deleted,
    /// or never completed).
    #[error("No server-side result for tracking id '{tracking_id}'")]
    NotFound { tracking_id: String },

    /// The service answered with a body the bindings could not decode.
    #[error("Unexpected response from the OCR service: {detail}")]
    UnexpectedResponse { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The batch run was cancelled before this document finished.
    #[error("Cancelled before completion")]
    Cancelled,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    /// Classify this error for batch reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::FileNotFound { .. } | OcrError::PermissionDenied { .. } => ErrorKind::Io,
            OcrError::Transport { .. } | OcrError::UnexpectedResponse { .. } => {
                ErrorKind::Transport
            }
            OcrError::Rejected { .. } => ErrorKind::Rejected,
            OcrError::Remote { .. } => ErrorKind::Remote,
            OcrError::Timeout { .. } => ErrorKind::Timeout,
            OcrError::NotFound { .. } => ErrorKind::NotFound,
            OcrError::OutputWriteFailed { .. } => ErrorKind::Io,
            OcrError::InvalidConfig(_) => ErrorKind::Config,
            OcrError::Cancelled => ErrorKind::Cancelled,
            OcrError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Build a [`OcrError::Transport`] from a reqwest error, preserving the
    /// most useful detail (timeouts and connect failures read differently).
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        let detail = if err.is_timeout() {
            format!("timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        OcrError::Transport { detail }
    }
}

/// Coarse error classification carried by
/// [`crate::output::BatchItemResult`] failures.
///
/// The batch driver reports `kind` + human-readable detail rather than the
/// full error value so results stay serialisable and comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Rejected,
    Remote,
    Timeout,
    NotFound,
    Cancelled,
    Io,
    Config,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Remote => "remote",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}
