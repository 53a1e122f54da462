//! # ocr2md
//!
//! Convert documents to Markdown through a remote OCR service.
//!
//! ## Why this crate?
//!
//! The remote service does the hard part — recognising scanned pages, math,
//! and tables — but getting a *complete* result out of it reliably is its own
//! problem: the fast path is a live page-event stream that delivers pages out
//! of order and can drop mid-document with no restart semantics, and the
//! output it produces references figures through the service's CDN, so the
//! files are not self-contained. This crate owns that reliability layer:
//! stream-with-polling-fallback acquisition, one-fetch-per-asset image
//! localization, and a bounded-concurrency batch driver that isolates
//! per-document failures.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Submit    multipart upload → tracking id
//!  ├─ 2. Acquire   page-event stream, falling back to status polling
//!  │               plus a full download when the stream drops early
//!  ├─ 3. Write     primary .mmd + requested extra formats (atomic)
//!  ├─ 4. Localize  fetch each CDN asset once, rewrite references
//!  └─ 5. Report    one BatchItemResult per input, in input order
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocr2md::{BatchDriver, ConvertConfig, Credentials, RemoteClient};
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RemoteClient::new(Credentials::from_env()?)?;
//!     let config = ConvertConfig::builder().concurrency(2).build()?;
//!
//!     let driver = BatchDriver::new(Arc::new(client), config);
//!     let summary = driver
//!         .run(&[PathBuf::from("paper.pdf")], Path::new("out"))
//!         .await;
//!
//!     for item in &summary.results {
//!         println!("{}: {:?}", item.input.display(), item.outcome);
//!     }
//!     std::process::exit(summary.exit_code());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr2md` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! ocr2md = { version = "0.4", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod acquire;
pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod localize;
pub mod naming;
pub mod output;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use acquire::{AcquisitionState, AssembledDocument, ResultAcquirer};
pub use batch::{BatchCounters, BatchDriver, CountersSnapshot};
pub use client::{
    ClientTimeouts, Credentials, DocumentList, DocumentRecord, DocumentService, ListQuery,
    PageEvent, PageEventStream, ProcessingStatus, RemoteClient, StatusResponse, SubmissionHandle,
};
pub use config::{ConvertConfig, ConvertConfigBuilder, OutputFormat, SubmitOptions};
pub use error::{ErrorKind, OcrError};
pub use localize::{AssetFailure, AssetLocalizer, LocalAsset, LocalizeReport};
pub use naming::NamingPolicy;
pub use output::{
    AcquiredDocument, AcquisitionRoute, BatchItemResult, BatchSummary, DocumentOutcome,
    ItemOutcome,
};
pub use progress::{BatchProgressCallback, NoopBatchProgress, ProgressCallback};
