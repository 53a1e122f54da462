//! Batch driver: run many documents through the pipeline at once.
//!
//! Each input runs the same per-document pipeline — submit, acquire,
//! write outputs, localize assets — as an independent task, fanned out with
//! [`futures::stream::StreamExt::buffer_unordered`] under a configurable
//! concurrency bound. Failures are isolated: a rejected submission or a
//! timed-out poll produces a `Failure` row for that input and never cancels
//! or delays sibling pipelines. The result set is re-sorted into input order
//! at the end so callers get a deterministic report no matter how
//! completion interleaved.
//!
//! Each document writes to its own uniquely named subtree under the output
//! directory, so no cross-document locking exists anywhere. The asset dedup
//! set is private to each document's localization pass — two documents
//! referencing the same remote URL fetch it twice by design; duplicated
//! downloads are cheaper than shared mutable cache state.

use crate::acquire::ResultAcquirer;
use crate::client::DocumentService;
use crate::config::ConvertConfig;
use crate::error::OcrError;
use crate::localize::{write_atomic, AssetLocalizer};
use crate::naming;
use crate::output::{BatchItemResult, BatchSummary, DocumentOutcome, ItemOutcome};
use crate::progress::{BatchProgressCallback, NoopBatchProgress};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Monotone aggregate counters, readable while the batch is running.
///
/// Decoupled from display: a progress bar, a log line, or nothing at all
/// can sit on top of these.
#[derive(Debug, Default)]
pub struct BatchCounters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// Point-in-time view of [`BatchCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Runs N independent (submit → acquire → localize) pipelines with a
/// bounded number in flight.
pub struct BatchDriver {
    service: Arc<dyn DocumentService>,
    config: ConvertConfig,
    progress: Arc<dyn BatchProgressCallback>,
    counters: Arc<BatchCounters>,
    cancel: CancellationToken,
}

impl BatchDriver {
    pub fn new(service: Arc<dyn DocumentService>, config: ConvertConfig) -> Self {
        Self {
            service,
            config,
            progress: Arc::new(NoopBatchProgress),
            counters: Arc::new(BatchCounters::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn BatchProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Live counters for external progress reporting.
    pub fn counters(&self) -> Arc<BatchCounters> {
        Arc::clone(&self.counters)
    }

    /// Token that aborts the batch when cancelled. In-flight network calls
    /// are dropped promptly; items that had not finished report a
    /// `Cancelled` failure, and no half-written files are left behind
    /// (every disk write is atomic and skipped once cancellation is seen).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every input, writing outputs under `out_dir`.
    ///
    /// Always yields exactly one result per input, in input order.
    pub async fn run(&self, inputs: &[PathBuf], out_dir: &Path) -> BatchSummary {
        self.progress.on_batch_start(inputs.len());
        info!(
            "Processing {} document(s), concurrency {}",
            inputs.len(),
            self.config.concurrency
        );

        let mut indexed: Vec<(usize, BatchItemResult)> = stream::iter(
            inputs
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, input)| async move {
                    self.progress.on_item_start(&input);
                    let outcome = match self.process_one(&input, out_dir).await {
                        Ok(outcome) => {
                            self.counters.completed.fetch_add(1, Ordering::SeqCst);
                            self.progress.on_item_complete(&input, &outcome);
                            ItemOutcome::Success(outcome)
                        }
                        Err(e) => {
                            let kind = e.kind();
                            let detail = e.to_string();
                            self.counters.failed.fetch_add(1, Ordering::SeqCst);
                            self.progress.on_item_error(&input, kind, &detail);
                            warn!("{} failed ({kind}): {detail}", input.display());
                            ItemOutcome::Failure { kind, detail }
                        }
                    };
                    (index, BatchItemResult { input, outcome })
                }),
        )
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await;

        // Completion order is arbitrary; the report is not.
        indexed.sort_by_key(|(index, _)| *index);
        let summary = BatchSummary {
            results: indexed.into_iter().map(|(_, r)| r).collect(),
        };

        self.progress
            .on_batch_complete(summary.succeeded(), summary.failed());
        info!(
            "Batch complete: {}/{} succeeded",
            summary.succeeded(),
            summary.results.len()
        );
        summary
    }

    /// One document's full pipeline. Every error is caught by `run` and
    /// converted into this input's `Failure` row.
    async fn process_one(&self, input: &Path, out_dir: &Path) -> Result<DocumentOutcome, OcrError> {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let name = naming::derive_name(self.config.naming, input)?;
        let doc_dir = out_dir.join(&name);
        let primary_path = doc_dir.join(format!("{stem}.mmd"));

        // Stable naming makes resubmission detectable: same bytes, same
        // subtree. Skip unless the caller forces a rerun.
        if !self.config.force && primary_path.exists() {
            info!("{} already converted → {}", input.display(), primary_path.display());
            return Ok(DocumentOutcome {
                tracking_id: None,
                output_paths: vec![primary_path],
                pages_received: 0,
                expected_pages: None,
                route: None,
                missing_pages: Vec::new(),
                asset_failures: Vec::new(),
                skipped: true,
            });
        }

        // ── Submit ───────────────────────────────────────────────────────
        let options = self.config.submit.with_streaming(self.config.streaming);
        let handle = self
            .guarded(self.service.submit(input, &options))
            .await?;
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        info!(
            "{} submitted → tracking id {}",
            input.display(),
            handle.tracking_id
        );

        // ── Acquire ──────────────────────────────────────────────────────
        let acquirer = ResultAcquirer::new(Arc::clone(&self.service), self.config.clone());
        let progress = Arc::clone(&self.progress);
        let input_for_pages = input.to_path_buf();
        let acquired = self
            .guarded(acquirer.acquire(&handle, move |received, expected| {
                progress.on_item_pages(&input_for_pages, received, expected);
            }))
            .await?;

        // ── Write outputs ────────────────────────────────────────────────
        if self.cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }
        write_atomic(&primary_path, acquired.text.as_bytes()).await?;
        let mut output_paths = vec![primary_path.clone()];

        let mut text_siblings: Vec<PathBuf> = Vec::new();
        for format in &self.config.extra_formats {
            let bytes = self.guarded(self.service.download(&handle, *format)).await?;
            let path = doc_dir.join(format!("{stem}.{}", format.extension()));
            if self.cancel.is_cancelled() {
                return Err(OcrError::Cancelled);
            }
            write_atomic(&path, &bytes).await?;
            if format.is_text() {
                text_siblings.push(path.clone());
            }
            output_paths.push(path);
        }

        // ── Localize assets ──────────────────────────────────────────────
        let asset_failures = if self.config.localize_images {
            let localizer = AssetLocalizer::new(
                Arc::clone(&self.service),
                self.config.asset_url_prefix.clone(),
                self.config.force,
            )?;
            let report = self
                .guarded(localizer.localize(&primary_path, &text_siblings, &doc_dir.join("images")))
                .await?;
            report.failures
        } else {
            Vec::new()
        };

        // ── Server-side cleanup ──────────────────────────────────────────
        if self.config.delete_remote {
            if let Err(e) = self.service.delete_result(&handle).await {
                // Cleanup is best-effort; the document is already on disk.
                warn!("Failed to delete remote result {}: {e}", handle.tracking_id);
            }
        }

        Ok(DocumentOutcome {
            tracking_id: Some(handle.tracking_id),
            output_paths,
            pages_received: acquired.pages_received,
            expected_pages: acquired.expected_pages,
            route: Some(acquired.route),
            missing_pages: acquired.missing_pages,
            asset_failures,
            skipped: false,
        })
    }

    /// Race a pipeline stage against batch cancellation. Dropping the stage
    /// future aborts any in-flight network call.
    async fn guarded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, OcrError>>,
    ) -> Result<T, OcrError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OcrError::Cancelled),
            result = fut => result,
        }
    }
}
