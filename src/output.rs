//! Result types produced by the pipeline.
//!
//! Everything here is serialisable so callers can persist or report run
//! results as JSON (`--json` in the CLI). Warnings are data, not errors:
//! a document acquired with missing pages still carries its text, plus the
//! exact list of gaps, so the caller decides what partial output is worth.

use crate::error::ErrorKind;
use crate::localize::AssetFailure;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the final text of a document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionRoute {
    /// Every expected page arrived on the stream.
    Streamed,
    /// The stream ended early and the status double-check was skipped;
    /// the text is whatever pages were received.
    StreamedBestEffort,
    /// Status polling confirmed completion and the text came from a full
    /// download (either because streaming was disabled or as fallback).
    Polled,
}

/// A completely acquired document, before any post-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquiredDocument {
    /// Concatenated page text in ascending page order.
    pub text: String,
    /// Count of distinct pages actually received. Observable regardless of
    /// route, so truncated best-effort output is detectable.
    pub pages_received: usize,
    /// Expected page count, once the service reported it.
    pub expected_pages: Option<usize>,
    pub route: AcquisitionRoute,
    /// Page indices missing from the assembly. Non-empty only on the
    /// best-effort route; a warning, not an error.
    pub missing_pages: Vec<usize>,
}

impl AcquiredDocument {
    /// True when pages are known or suspected to be missing.
    pub fn is_incomplete(&self) -> bool {
        !self.missing_pages.is_empty()
    }
}

/// Everything produced for one successfully processed input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    /// Server-side tracking identifier, for later inspection or deletion.
    pub tracking_id: Option<String>,
    /// Files written, primary text first.
    pub output_paths: Vec<PathBuf>,
    pub pages_received: usize,
    pub expected_pages: Option<usize>,
    pub route: Option<AcquisitionRoute>,
    /// Missing-page warning carried over from acquisition.
    pub missing_pages: Vec<usize>,
    /// Assets that could not be localized; their references were left
    /// pointing at the remote URLs.
    pub asset_failures: Vec<AssetFailure>,
    /// True when the output already existed under stable naming and the
    /// pipeline did not resubmit.
    pub skipped: bool,
}

/// Terminal result of one input's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success(DocumentOutcome),
    Failure { kind: ErrorKind, detail: String },
}

/// One row of the batch result set; immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub input: PathBuf,
    pub outcome: ItemOutcome,
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Success(_))
    }
}

/// Aggregate result of a batch run. One entry per input, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub results: Vec<BatchItemResult>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Suggested process exit code: non-zero iff any item failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_row(name: &str) -> BatchItemResult {
        BatchItemResult {
            input: PathBuf::from(name),
            outcome: ItemOutcome::Success(DocumentOutcome {
                tracking_id: Some("t-1".into()),
                output_paths: vec![PathBuf::from("out.mmd")],
                pages_received: 3,
                expected_pages: Some(3),
                route: Some(AcquisitionRoute::Streamed),
                missing_pages: vec![],
                asset_failures: vec![],
                skipped: false,
            }),
        }
    }

    #[test]
    fn summary_counts_and_exit_code() {
        let summary = BatchSummary {
            results: vec![
                success_row("a.pdf"),
                BatchItemResult {
                    input: PathBuf::from("b.pdf"),
                    outcome: ItemOutcome::Failure {
                        kind: ErrorKind::Rejected,
                        detail: "encrypted".into(),
                    },
                },
            ],
        };
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.exit_code(), 1);

        let all_ok = BatchSummary {
            results: vec![success_row("a.pdf")],
        };
        assert_eq!(all_ok.exit_code(), 0);
    }

    #[test]
    fn summary_serialises_to_json() {
        let summary = BatchSummary {
            results: vec![success_row("a.pdf")],
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"streamed\""));
        let back: BatchSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.results.len(), 1);
    }

    #[test]
    fn incomplete_flag_follows_missing_pages() {
        let doc = AcquiredDocument {
            text: "p1".into(),
            pages_received: 1,
            expected_pages: Some(2),
            route: AcquisitionRoute::StreamedBestEffort,
            missing_pages: vec![2],
        };
        assert!(doc.is_incomplete());
    }
}
