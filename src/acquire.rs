//! Result acquisition: turn a submission handle into a complete document.
//!
//! The remote service offers two ways to get a result out: a live page-event
//! stream, and status polling followed by a full download. The stream is
//! faster but unreliable — events arrive out of order, duplicates happen,
//! and the connection can drop at any point with no restart semantics. This
//! module models the recovery logic as an explicit state machine so every
//! transition is independently testable:
//!
//! ```text
//! Submitted ──streaming──▶ Streaming ──all pages──▶ Completed
//!     │                        │
//!     │ streaming disabled     │ stream closed early / connection error
//!     ▼                        ▼
//!  Polling ◀──default── StreamIncomplete ──skip-status-check──▶ Completed
//!     │                                                        (best effort)
//!     ├── status = completed ──▶ Completed (full download)
//!     ├── status = error ──────▶ Failed (remote)
//!     └── wait bound exceeded ─▶ Failed (timeout)
//! ```
//!
//! The stream is never reopened after it drops: recovery always goes through
//! polling plus a full download, because the service does not replay events.

use crate::client::{DocumentService, PageEvent, ProcessingStatus, SubmissionHandle};
use crate::config::{ConvertConfig, OutputFormat};
use crate::error::OcrError;
use crate::output::{AcquiredDocument, AcquisitionRoute};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

/// Acquisition phases. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Submitted,
    Streaming,
    StreamIncomplete,
    Polling,
    Completed,
    Failed,
}

/// Where to go once the document is submitted.
fn after_submit(streaming: bool) -> AcquisitionState {
    if streaming {
        AcquisitionState::Streaming
    } else {
        AcquisitionState::Polling
    }
}

/// Where to go when the stream ends (server close or connection error).
fn after_stream_end(complete: bool) -> AcquisitionState {
    if complete {
        AcquisitionState::Completed
    } else {
        AcquisitionState::StreamIncomplete
    }
}

/// Where to go from an incomplete stream.
///
/// Best effort needs something to be best-effort about: with zero pages
/// received there is no partial output to accept, so the skip flag is
/// ignored and recovery goes through polling.
fn after_stream_incomplete(skip_status_check: bool, pages_received: usize) -> AcquisitionState {
    if skip_status_check && pages_received > 0 {
        AcquisitionState::Completed
    } else {
        AcquisitionState::Polling
    }
}

// ── Page assembly ────────────────────────────────────────────────────────

/// Out-of-order page buffer.
///
/// Pages are keyed by their 1-indexed position; a duplicate event for an
/// already-present index overwrites idempotently and never appends. The
/// expected total is learned from the first event or poll response that
/// carries it.
#[derive(Debug, Default)]
pub struct AssembledDocument {
    pages: BTreeMap<usize, String>,
    expected: Option<usize>,
}

impl AssembledDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event. Returns true if this was a new page index.
    pub fn record(&mut self, event: PageEvent) -> bool {
        if event.total_selected > 0 {
            self.expected = Some(event.total_selected);
        }
        if event.page_idx == 0 {
            // The service indexes pages from 1; 0 marks a non-page line.
            return false;
        }
        self.pages.insert(event.page_idx, event.text).is_none()
    }

    pub fn set_expected(&mut self, total: usize) {
        if total > 0 {
            self.expected = Some(total);
        }
    }

    /// Number of distinct page indices received.
    pub fn distinct_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    /// Complete when every index `1..=expected` is present.
    pub fn is_complete(&self) -> bool {
        match self.expected {
            Some(total) if total > 0 => {
                self.pages.len() >= total && (1..=total).all(|i| self.pages.contains_key(&i))
            }
            _ => false,
        }
    }

    /// Concatenate pages in ascending index order and report gaps.
    ///
    /// The gap list covers every absent index up to the larger of the
    /// highest received index and the expected total, so tail truncation is
    /// reported alongside interior gaps.
    pub fn assemble(&self) -> (String, Vec<usize>) {
        let max_received = self.pages.keys().next_back().copied().unwrap_or(0);
        let upper = max_received.max(self.expected.unwrap_or(0));

        let text: String = self.pages.values().map(String::as_str).collect();
        let missing: Vec<usize> = (1..=upper).filter(|i| !self.pages.contains_key(i)).collect();
        (text, missing)
    }
}

// ── Acquirer ─────────────────────────────────────────────────────────────

/// Drives one submission handle to a complete output document.
pub struct ResultAcquirer {
    service: Arc<dyn DocumentService>,
    config: ConvertConfig,
}

impl ResultAcquirer {
    pub fn new(service: Arc<dyn DocumentService>, config: ConvertConfig) -> Self {
        Self { service, config }
    }

    /// Run the acquisition state machine to a terminal state.
    ///
    /// `on_page` is invoked as page progress becomes known — with the
    /// distinct-page count during streaming, and with the service-reported
    /// completed count during polling.
    pub async fn acquire<F>(
        &self,
        handle: &SubmissionHandle,
        mut on_page: F,
    ) -> Result<AcquiredDocument, OcrError>
    where
        F: FnMut(usize, Option<usize>) + Send,
    {
        let mut doc = AssembledDocument::new();
        let mut state = after_submit(self.config.streaming);

        if state == AcquisitionState::Streaming {
            match self.run_stream(handle, &mut doc, &mut on_page).await {
                Ok(()) => {
                    state = after_stream_end(doc.is_complete());
                }
                Err(e) => {
                    // A dropped connection mid-stream is recoverable; the
                    // pages already buffered stay in the assembly.
                    warn!(
                        "[{}] stream failed after {} pages: {e}",
                        handle.tracking_id,
                        doc.distinct_pages()
                    );
                    state = after_stream_end(false);
                }
            }

            if state == AcquisitionState::StreamIncomplete {
                state = after_stream_incomplete(
                    self.config.skip_status_check,
                    doc.distinct_pages(),
                );
            }

            if state == AcquisitionState::Completed {
                let (text, missing) = doc.assemble();
                let route = if doc.is_complete() {
                    info!(
                        "[{}] all {} pages received via stream",
                        handle.tracking_id,
                        doc.distinct_pages()
                    );
                    AcquisitionRoute::Streamed
                } else {
                    warn!(
                        "[{}] best-effort output: {} pages missing",
                        handle.tracking_id,
                        missing.len()
                    );
                    AcquisitionRoute::StreamedBestEffort
                };
                return Ok(AcquiredDocument {
                    text,
                    pages_received: doc.distinct_pages(),
                    expected_pages: doc.expected(),
                    route,
                    missing_pages: missing,
                });
            }
        }

        debug_assert_eq!(state, AcquisitionState::Polling);
        self.run_polling(handle, &mut doc, &mut on_page).await
    }

    /// Consume the page-event stream until completeness or server close.
    async fn run_stream<F>(
        &self,
        handle: &SubmissionHandle,
        doc: &mut AssembledDocument,
        on_page: &mut F,
    ) -> Result<(), OcrError>
    where
        F: FnMut(usize, Option<usize>) + Send,
    {
        let mut stream = self.service.open_stream(handle).await?;

        while let Some(item) = stream.next().await {
            let event = item?;
            debug!(
                "[{}] page event {}/{}",
                handle.tracking_id,
                event.page_idx,
                event.total_selected
            );
            doc.record(event);
            on_page(doc.distinct_pages(), doc.expected());

            // Don't wait for the server to half-close once the set is full.
            if doc.is_complete() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Poll status until a terminal state, then download the full document.
    ///
    /// The download replaces whatever partial assembly streaming left
    /// behind — the stream cannot be restarted, so the only gap-free source
    /// after an incomplete stream is the completed document itself.
    async fn run_polling<F>(
        &self,
        handle: &SubmissionHandle,
        doc: &mut AssembledDocument,
        on_page: &mut F,
    ) -> Result<AcquiredDocument, OcrError>
    where
        F: FnMut(usize, Option<usize>) + Send,
    {
        let deadline = Instant::now() + Duration::from_secs(self.config.max_poll_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let mut consecutive_failures: u32 = 0;

        loop {
            match self.service.poll_status(handle).await {
                Ok(status) => {
                    consecutive_failures = 0;
                    doc.set_expected(status.num_pages);
                    on_page(status.num_pages_completed, doc.expected());
                    debug!(
                        "[{}] status {:?}: {}/{} pages ({:.1}%)",
                        handle.tracking_id,
                        status.status,
                        status.num_pages_completed,
                        status.num_pages,
                        status.percent_done
                    );

                    match status.status {
                        ProcessingStatus::Completed => {
                            let bytes = self.service.download(handle, OutputFormat::Mmd).await?;
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            let expected = doc.expected();
                            let pages = expected.unwrap_or_else(|| doc.distinct_pages());
                            info!("[{}] completed via polling", handle.tracking_id);
                            return Ok(AcquiredDocument {
                                text,
                                pages_received: pages,
                                expected_pages: expected,
                                route: AcquisitionRoute::Polled,
                                missing_pages: Vec::new(),
                            });
                        }
                        ProcessingStatus::Error => {
                            return Err(OcrError::Remote {
                                detail: status
                                    .error
                                    .unwrap_or_else(|| "service reported an error".to_string()),
                            });
                        }
                        _ => {}
                    }
                }
                Err(e @ (OcrError::Rejected { .. } | OcrError::NotFound { .. })) => {
                    // The service gave a definitive answer; retrying cannot
                    // change it.
                    return Err(e);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        "[{}] status poll failed ({consecutive_failures}/{}): {e}",
                        handle.tracking_id, self.config.max_poll_failures
                    );
                    if consecutive_failures > self.config.max_poll_failures {
                        return Err(e);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(OcrError::Timeout {
                    waited_secs: self.config.max_poll_secs,
                });
            }
            sleep(interval).await;
        }
    }
}
