//! Progress-callback trait for batch pipeline events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::batch::BatchDriver::with_progress`] to receive real-time events
//! as documents move through submit → acquire → localize.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a channel, a log, or a terminal progress bar without the
//! library knowing how the host application communicates. The trait is
//! `Send + Sync` because documents are processed concurrently; methods for
//! different documents may fire from different tasks at the same time, so
//! implementations must protect shared mutable state.

use crate::error::ErrorKind;
use crate::output::DocumentOutcome;
use std::path::Path;
use std::sync::Arc;

/// Called by the batch driver as it processes each input.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any input is submitted.
    fn on_batch_start(&self, total_inputs: usize) {
        let _ = total_inputs;
    }

    /// Called when an input's pipeline begins (just before submission).
    fn on_item_start(&self, input: &Path) {
        let _ = input;
    }

    /// Called as page progress for one input becomes known — with the
    /// distinct-page count during streaming, or the service-reported
    /// completed count during polling. `expected` is `None` until the
    /// service has announced a total.
    fn on_item_pages(&self, input: &Path, received: usize, expected: Option<usize>) {
        let _ = (input, received, expected);
    }

    /// Called when an input's pipeline finishes successfully.
    fn on_item_complete(&self, input: &Path, outcome: &DocumentOutcome) {
        let _ = (input, outcome);
    }

    /// Called when an input's pipeline fails terminally.
    fn on_item_error(&self, input: &Path, kind: ErrorKind, detail: &str) {
        let _ = (input, kind, detail);
    }

    /// Called once after every input has a result.
    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        let _ = (succeeded, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopBatchProgress;

impl BatchProgressCallback for NoopBatchProgress {}

/// Convenience alias matching the type stored by the batch driver.
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
