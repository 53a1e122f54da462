//! Pipeline integration tests against an in-memory service.
//!
//! The `DocumentService` trait is the crate's only seam to the network, so
//! everything the pipeline promises — out-of-order assembly, the
//! stream-to-polling fallback, one fetch per distinct asset URL, per-item
//! failure isolation — is exercised here with a scripted mock and no I/O
//! beyond a temp directory.

use async_trait::async_trait;
use chrono::Utc;
use ocr2md::{
    AcquisitionRoute, BatchDriver, ConvertConfig, DocumentList, DocumentService, ErrorKind,
    ItemOutcome, ListQuery, OcrError, OutputFormat, PageEvent, PageEventStream, ProcessingStatus,
    ResultAcquirer, StatusResponse, SubmissionHandle, SubmitOptions,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ── Scripted mock service ────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct DocScript {
    /// Service rejection code; `Some` makes every submit of this input fail.
    reject_code: Option<&'static str>,
    /// Events published on the stream before the server closes it.
    events: Vec<(usize, usize, &'static str)>,
    /// End the stream with a connection error instead of a clean close.
    stream_breaks: bool,
    /// Number of initial polls that fail with a transport error.
    poll_failures: usize,
    /// Status responses, one per poll; the last entry repeats forever.
    statuses: Vec<StatusResponse>,
    /// Body served for full downloads.
    download_text: &'static str,
}

fn status(s: ProcessingStatus, completed: usize, total: usize) -> StatusResponse {
    StatusResponse {
        status: s,
        num_pages: total,
        num_pages_completed: completed,
        percent_done: if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        },
        error: None,
    }
}

#[derive(Default)]
struct MockService {
    scripts: HashMap<String, DocScript>,
    /// Bytes served per asset URL; an absent URL fails to fetch.
    assets: HashMap<String, Vec<u8>>,
    submits: Mutex<Vec<String>>,
    polls: Mutex<HashMap<String, usize>>,
    pending_statuses: Mutex<HashMap<String, VecDeque<StatusResponse>>>,
    fetches: Mutex<HashMap<String, usize>>,
    deleted: Mutex<Vec<String>>,
}

impl MockService {
    fn new() -> Self {
        Self::default()
    }

    fn script(mut self, name: &str, script: DocScript) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    fn asset(mut self, url: &str, bytes: &[u8]) -> Self {
        self.assets.insert(url.to_string(), bytes.to_vec());
        self
    }

    fn script_for(&self, tracking_id: &str) -> DocScript {
        self.scripts.get(tracking_id).cloned().unwrap_or_default()
    }

    fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn poll_count(&self, tracking_id: &str) -> usize {
        self.polls
            .lock()
            .unwrap()
            .get(tracking_id)
            .copied()
            .unwrap_or(0)
    }

    fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }
}

#[async_trait]
impl DocumentService for MockService {
    async fn submit(
        &self,
        document: &Path,
        _options: &SubmitOptions,
    ) -> Result<SubmissionHandle, OcrError> {
        let stem = document
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        self.submits.lock().unwrap().push(stem.clone());

        let script = self.script_for(&stem);
        if let Some(code) = script.reject_code {
            return Err(OcrError::Rejected {
                code: code.to_string(),
                detail: "service declined the document".into(),
            });
        }
        Ok(SubmissionHandle {
            tracking_id: stem,
            submitted_at: Utc::now(),
        })
    }

    async fn open_stream(&self, handle: &SubmissionHandle) -> Result<PageEventStream, OcrError> {
        let script = self.script_for(&handle.tracking_id);
        let mut items: Vec<Result<PageEvent, OcrError>> = script
            .events
            .iter()
            .map(|&(idx, total, text)| {
                Ok(PageEvent {
                    page_idx: idx,
                    total_selected: total,
                    text: text.to_string(),
                })
            })
            .collect();
        if script.stream_breaks {
            items.push(Err(OcrError::Transport {
                detail: "connection reset by peer".into(),
            }));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn poll_status(&self, handle: &SubmissionHandle) -> Result<StatusResponse, OcrError> {
        let count = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(handle.tracking_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if count <= self.script_for(&handle.tracking_id).poll_failures {
            return Err(OcrError::Transport {
                detail: "gateway hiccup".into(),
            });
        }

        let mut pending = self.pending_statuses.lock().unwrap();
        let queue = pending
            .entry(handle.tracking_id.clone())
            .or_insert_with(|| self.script_for(&handle.tracking_id).statuses.into());

        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| OcrError::NotFound {
                    tracking_id: handle.tracking_id.clone(),
                })
        }
    }

    async fn download(
        &self,
        handle: &SubmissionHandle,
        _format: OutputFormat,
    ) -> Result<Vec<u8>, OcrError> {
        Ok(self
            .script_for(&handle.tracking_id)
            .download_text
            .as_bytes()
            .to_vec())
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, OcrError> {
        *self.fetches.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        self.assets
            .get(url)
            .cloned()
            .ok_or_else(|| OcrError::Transport {
                detail: format!("HTTP 502 fetching {url}"),
            })
    }

    async fn delete_result(&self, handle: &SubmissionHandle) -> Result<(), OcrError> {
        self.deleted.lock().unwrap().push(handle.tracking_id.clone());
        Ok(())
    }

    async fn list_documents(&self, _query: &ListQuery) -> Result<DocumentList, OcrError> {
        Ok(DocumentList::default())
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

fn handle(id: &str) -> SubmissionHandle {
    SubmissionHandle {
        tracking_id: id.to_string(),
        submitted_at: Utc::now(),
    }
}

fn fast_config() -> ConvertConfig {
    ConvertConfig::builder()
        .poll_interval_secs(1)
        .max_poll_secs(30)
        .build()
        .unwrap()
}

fn write_input(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

// ── Acquisition ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_stream_assembles_in_page_order() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            events: vec![(1, 3, "p1;"), (3, 3, "p3;"), (2, 3, "p2;")],
            ..Default::default()
        },
    ));

    let acquirer = ResultAcquirer::new(service.clone() as Arc<dyn DocumentService>, fast_config());
    let doc = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap();

    assert_eq!(doc.text, "p1;p2;p3;");
    assert_eq!(doc.pages_received, 3);
    assert_eq!(doc.expected_pages, Some(3));
    assert_eq!(doc.route, AcquisitionRoute::Streamed);
    assert!(doc.missing_pages.is_empty());
    // A complete stream needs no status traffic at all.
    assert_eq!(service.poll_count("doc"), 0);
}

#[tokio::test]
async fn duplicate_stream_events_do_not_duplicate_output() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            events: vec![(1, 2, "old-1;"), (2, 2, "p2;"), (1, 2, "p1;")],
            ..Default::default()
        },
    ));

    let acquirer = ResultAcquirer::new(service as Arc<dyn DocumentService>, fast_config());
    let doc = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap();

    // Overwrite, never append: the last event for page 1 wins once...
    // except completion is reached at the second distinct page, so the
    // first version of page 1 is what got sealed into the assembly.
    assert_eq!(doc.pages_received, 2);
    assert_eq!(doc.text.matches("p2;").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn incomplete_stream_recovers_via_polling_and_full_download() {
    let service = Arc::new(
        MockService::new().script(
            "doc",
            DocScript {
                events: vec![(1, 2, "p1;")],
                statuses: vec![
                    status(ProcessingStatus::Split, 1, 2),
                    status(ProcessingStatus::Completed, 2, 2),
                ],
                download_text: "p1;p2;",
                ..Default::default()
            },
        ),
    );

    let acquirer = ResultAcquirer::new(service.clone() as Arc<dyn DocumentService>, fast_config());
    let doc = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap();

    // The full download replaces the partial assembly: no gaps.
    assert_eq!(doc.text, "p1;p2;");
    assert_eq!(doc.route, AcquisitionRoute::Polled);
    assert!(doc.missing_pages.is_empty());
    assert!(service.poll_count("doc") >= 2);
}

#[tokio::test(start_paused = true)]
async fn broken_stream_connection_also_falls_back_to_polling() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            events: vec![(1, 3, "p1;")],
            stream_breaks: true,
            statuses: vec![status(ProcessingStatus::Completed, 3, 3)],
            download_text: "p1;p2;p3;",
            ..Default::default()
        },
    ));

    let acquirer = ResultAcquirer::new(service as Arc<dyn DocumentService>, fast_config());
    let doc = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap();

    assert_eq!(doc.text, "p1;p2;p3;");
    assert_eq!(doc.route, AcquisitionRoute::Polled);
}

#[tokio::test]
async fn skip_status_check_accepts_partial_stream() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            events: vec![(1, 3, "p1;"), (3, 3, "p3;")],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder()
        .skip_status_check(true)
        .build()
        .unwrap();
    let acquirer = ResultAcquirer::new(service.clone() as Arc<dyn DocumentService>, config);
    let doc = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap();

    assert_eq!(doc.route, AcquisitionRoute::StreamedBestEffort);
    assert_eq!(doc.text, "p1;p3;");
    // Truncation is detectable even though the double-check was skipped.
    assert_eq!(doc.pages_received, 2);
    assert_eq!(doc.missing_pages, vec![2]);
    assert_eq!(service.poll_count("doc"), 0, "no status traffic when skipped");
}

#[tokio::test(start_paused = true)]
async fn remote_error_status_fails_with_remote_kind() {
    let mut error_status = status(ProcessingStatus::Error, 0, 2);
    error_status.error = Some("conversion failed".into());
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            statuses: vec![error_status],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder().streaming(false).build().unwrap();
    let acquirer = ResultAcquirer::new(service as Arc<dyn DocumentService>, config);
    let err = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(err.to_string().contains("conversion failed"));
}

#[tokio::test(start_paused = true)]
async fn polling_bound_exceeded_fails_with_timeout_kind() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            statuses: vec![status(ProcessingStatus::Split, 1, 4)],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder()
        .streaming(false)
        .poll_interval_secs(1)
        .max_poll_secs(3)
        .build()
        .unwrap();
    let acquirer = ResultAcquirer::new(service as Arc<dyn DocumentService>, config);
    let err = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn transient_poll_failures_below_the_bound_recover() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            poll_failures: 2,
            statuses: vec![status(ProcessingStatus::Completed, 1, 1)],
            download_text: "all;",
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder()
        .streaming(false)
        .poll_interval_secs(1)
        .build()
        .unwrap();
    let acquirer = ResultAcquirer::new(service.clone() as Arc<dyn DocumentService>, config);
    let doc = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap();

    assert_eq!(doc.text, "all;");
    assert_eq!(service.poll_count("doc"), 3, "two failures, then success");
}

#[tokio::test(start_paused = true)]
async fn poll_failures_beyond_the_bound_fail_with_transport_kind() {
    let service = Arc::new(MockService::new().script(
        "doc",
        DocScript {
            poll_failures: 100,
            statuses: vec![status(ProcessingStatus::Split, 0, 1)],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder()
        .streaming(false)
        .poll_interval_secs(1)
        .max_poll_secs(60)
        .max_poll_failures(2)
        .build()
        .unwrap();
    let acquirer = ResultAcquirer::new(service.clone() as Arc<dyn DocumentService>, config);
    let err = acquirer.acquire(&handle("doc"), |_, _| {}).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(service.poll_count("doc"), 3, "bound is consecutive failures");
}

// ── Batch driver ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_failing_submit_is_isolated_from_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = vec![
        write_input(dir.path(), "a.pdf", b"doc a"),
        write_input(dir.path(), "b.pdf", b"doc b"),
        write_input(dir.path(), "c.pdf", b"doc c"),
    ];

    let ok = |text: &'static str| DocScript {
        events: vec![(1, 1, text)],
        ..Default::default()
    };
    let service = Arc::new(
        MockService::new()
            .script("a", ok("alpha"))
            .script(
                "b",
                DocScript {
                    reject_code: Some("pdf_page_limit_exceeded"),
                    ..Default::default()
                },
            )
            .script("c", ok("gamma")),
    );

    let config = ConvertConfig::builder()
        .concurrency(2)
        .localize_images(false)
        .build()
        .unwrap();
    let driver = BatchDriver::new(service.clone() as Arc<dyn DocumentService>, config);
    let counters = driver.counters();
    let summary = driver.run(&inputs, dir.path()).await;

    // Exactly one result per input, in input order.
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.succeeded(), 2);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.exit_code(), 1);

    assert!(summary.results[0].is_success());
    match &summary.results[1].outcome {
        ItemOutcome::Failure { kind, detail } => {
            assert_eq!(*kind, ErrorKind::Rejected);
            assert!(detail.contains("pdf_page_limit_exceeded"));
        }
        other => panic!("expected failure for b.pdf, got {other:?}"),
    }
    assert!(summary.results[2].is_success());

    let snap = counters.snapshot();
    assert_eq!(snap.completed, 2);
    assert_eq!(snap.failed, 1);

    // The successful outputs exist and carry the streamed text.
    if let ItemOutcome::Success(outcome) = &summary.results[0].outcome {
        let text = std::fs::read_to_string(&outcome.output_paths[0]).unwrap();
        assert_eq!(text, "alpha");
    }
}

#[tokio::test]
async fn worked_example_two_documents_one_clean_one_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = vec![
        write_input(dir.path(), "first.pdf", b"first"),
        write_input(dir.path(), "second.pdf", b"second"),
    ];

    let service = Arc::new(
        MockService::new()
            // 3 pages streamed out of order: completes via the stream.
            .script(
                "first",
                DocScript {
                    events: vec![(1, 3, "1;"), (3, 3, "3;"), (2, 3, "2;")],
                    ..Default::default()
                },
            )
            // Stream drops after 1 of 2 pages; polling later completes.
            .script(
                "second",
                DocScript {
                    events: vec![(1, 2, "only;")],
                    stream_breaks: true,
                    statuses: vec![status(ProcessingStatus::Completed, 2, 2)],
                    download_text: "one;two;",
                    ..Default::default()
                },
            ),
    );

    let config = ConvertConfig::builder()
        .concurrency(2)
        .poll_interval_secs(1)
        .localize_images(false)
        .build()
        .unwrap();
    let driver = BatchDriver::new(service as Arc<dyn DocumentService>, config);
    let summary = driver.run(&inputs, dir.path()).await;

    assert_eq!(summary.succeeded(), 2);

    let first = match &summary.results[0].outcome {
        ItemOutcome::Success(o) => o,
        other => panic!("first should succeed: {other:?}"),
    };
    assert_eq!(first.route, Some(AcquisitionRoute::Streamed));
    assert_eq!(first.pages_received, 3);
    let text = std::fs::read_to_string(&first.output_paths[0]).unwrap();
    assert_eq!(text, "1;2;3;");

    let second = match &summary.results[1].outcome {
        ItemOutcome::Success(o) => o,
        other => panic!("second should succeed: {other:?}"),
    };
    assert_eq!(second.route, Some(AcquisitionRoute::Polled));
    assert!(second.missing_pages.is_empty());
    let text = std::fs::read_to_string(&second.output_paths[0]).unwrap();
    assert_eq!(text, "one;two;");
}

#[tokio::test]
async fn cancelled_batch_reports_cancelled_items_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = vec![
        write_input(dir.path(), "a.pdf", b"doc a"),
        write_input(dir.path(), "b.pdf", b"doc b"),
    ];

    let service = Arc::new(MockService::new().script(
        "a",
        DocScript {
            events: vec![(1, 1, "text")],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder().localize_images(false).build().unwrap();
    let driver = BatchDriver::new(service.clone() as Arc<dyn DocumentService>, config);
    driver.cancel_token().cancel();

    let out = dir.path().join("out");
    let summary = driver.run(&inputs, &out).await;

    // Still one result per input; every item is a clean Cancelled failure.
    assert_eq!(summary.results.len(), 2);
    for item in &summary.results {
        match &item.outcome {
            ItemOutcome::Failure { kind, .. } => assert_eq!(*kind, ErrorKind::Cancelled),
            other => panic!("expected cancelled failure: {other:?}"),
        }
    }
    // Nothing was half-written to disk.
    assert!(!out.exists() || std::fs::read_dir(&out).unwrap().next().is_none());
}

#[tokio::test]
async fn stable_naming_skips_already_converted_input() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = vec![write_input(dir.path(), "a.pdf", b"stable bytes")];

    let service = Arc::new(MockService::new().script(
        "a",
        DocScript {
            events: vec![(1, 1, "text")],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder().localize_images(false).build().unwrap();
    let driver = BatchDriver::new(service.clone() as Arc<dyn DocumentService>, config.clone());
    let first = driver.run(&inputs, dir.path()).await;
    assert_eq!(first.succeeded(), 1);
    assert_eq!(service.submit_count(), 1);

    // Same bytes, same subtree: the second run never talks to the service.
    let driver = BatchDriver::new(service.clone() as Arc<dyn DocumentService>, config);
    let second = driver.run(&inputs, dir.path()).await;
    assert_eq!(second.succeeded(), 1);
    assert_eq!(service.submit_count(), 1, "no resubmission");
    match &second.results[0].outcome {
        ItemOutcome::Success(o) => assert!(o.skipped),
        other => panic!("expected skipped success: {other:?}"),
    }
}

#[tokio::test]
async fn delete_remote_removes_server_side_state_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = vec![write_input(dir.path(), "a.pdf", b"doc a")];

    let service = Arc::new(MockService::new().script(
        "a",
        DocScript {
            events: vec![(1, 1, "text")],
            ..Default::default()
        },
    ));

    let config = ConvertConfig::builder()
        .localize_images(false)
        .delete_remote(true)
        .build()
        .unwrap();
    let driver = BatchDriver::new(service.clone() as Arc<dyn DocumentService>, config);
    let summary = driver.run(&inputs, dir.path()).await;

    assert_eq!(summary.succeeded(), 1);
    assert_eq!(*service.deleted.lock().unwrap(), vec!["a".to_string()]);
}

// ── Asset localization ───────────────────────────────────────────────────────

const CDN: &str = "https://cdn.mathpix.com/cropped";

fn cdn_url(name: &str) -> String {
    format!("{CDN}/{name}?top_left_x=0&top_left_y=0&width=10&height=10")
}

#[tokio::test]
async fn assets_fetched_once_per_distinct_url_across_forms() {
    let dir = tempfile::tempdir().unwrap();
    let url_a = cdn_url("fig_a.jpg");
    let url_b = cdn_url("fig_b.jpg");

    // URL A appears twice in the text form and again in the JSON sibling.
    let primary = dir.path().join("doc.mmd");
    std::fs::write(
        &primary,
        format!("![a]({url_a})\nsome text\n![a again]({url_a})\n![b]({url_b})\n"),
    )
    .unwrap();
    let sibling = dir.path().join("doc.lines.json");
    std::fs::write(
        &sibling,
        format!(r#"{{"lines":[{{"image":"{url_a}"}},{{"image":"{url_b}"}}]}}"#),
    )
    .unwrap();

    let service = Arc::new(
        MockService::new()
            .asset(&url_a, b"jpeg-a")
            .asset(&url_b, b"jpeg-b"),
    );
    let localizer =
        ocr2md::AssetLocalizer::new(service.clone() as Arc<dyn DocumentService>, CDN, false)
            .unwrap();

    let report = localizer
        .localize(&primary, &[sibling.clone()], &dir.path().join("images"))
        .await
        .unwrap();

    assert_eq!(service.fetch_count(&url_a), 1);
    assert_eq!(service.fetch_count(&url_b), 1);
    assert_eq!(report.assets.len(), 2);
    assert!(report.failures.is_empty());
    // 3 occurrences of A + 2 of B (across both forms) rewritten.
    assert_eq!(report.rewritten, 5);

    let text = std::fs::read_to_string(&primary).unwrap();
    assert!(!text.contains(CDN), "no remote references left: {text}");
    assert!(text.contains("images/fig_a_x0_y0_w10_h10.jpg"));

    let json = std::fs::read_to_string(&sibling).unwrap();
    assert!(!json.contains(CDN));

    // The bytes landed under the asset directory.
    let asset = dir.path().join("images/fig_a_x0_y0_w10_h10.jpg");
    assert_eq!(std::fs::read(&asset).unwrap(), b"jpeg-a");
}

#[tokio::test]
async fn single_asset_failure_leaves_only_that_reference() {
    let dir = tempfile::tempdir().unwrap();
    let url_ok = cdn_url("ok.jpg");
    let url_dead = cdn_url("dead.jpg");

    let primary = dir.path().join("doc.mmd");
    std::fs::write(&primary, format!("![ok]({url_ok})\n![dead]({url_dead})\n")).unwrap();

    let service = Arc::new(MockService::new().asset(&url_ok, b"bytes"));
    let localizer =
        ocr2md::AssetLocalizer::new(service as Arc<dyn DocumentService>, CDN, false).unwrap();

    let report = localizer
        .localize(&primary, &[], &dir.path().join("images"))
        .await
        .unwrap();

    assert_eq!(report.assets.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].url, url_dead);

    let text = std::fs::read_to_string(&primary).unwrap();
    assert!(!text.contains(&url_ok), "fetched reference must be rewritten");
    assert!(
        text.contains(&url_dead),
        "failed reference must keep its remote URL"
    );
}

#[tokio::test]
async fn localizer_rerun_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let url = cdn_url("fig.jpg");

    let primary = dir.path().join("doc.mmd");
    std::fs::write(&primary, format!("![fig]({url})\n")).unwrap();

    let service = Arc::new(MockService::new().asset(&url, b"bytes"));
    let localizer =
        ocr2md::AssetLocalizer::new(service.clone() as Arc<dyn DocumentService>, CDN, false)
            .unwrap();
    let images = dir.path().join("images");

    localizer.localize(&primary, &[], &images).await.unwrap();
    let after_first = std::fs::read_to_string(&primary).unwrap();

    let report = localizer.localize(&primary, &[], &images).await.unwrap();
    let after_second = std::fs::read_to_string(&primary).unwrap();

    assert_eq!(service.fetch_count(&url), 1, "no duplicate download");
    assert_eq!(report.rewritten, 0);
    assert_eq!(after_first, after_second, "document unchanged on rerun");
}

// ── End-to-end with localization ─────────────────────────────────────────────

#[tokio::test]
async fn batch_localizes_streamed_document() {
    let dir = tempfile::tempdir().unwrap();
    let url = cdn_url("inline.jpg");
    let inputs = vec![write_input(dir.path(), "doc.pdf", b"doc")];

    let service = Arc::new(
        MockService::new()
            .script(
                "doc",
                DocScript {
                    events: vec![(1, 1, "![fig](https://cdn.mathpix.com/cropped/inline.jpg?top_left_x=0&top_left_y=0&width=10&height=10)\n")],
                    ..Default::default()
                },
            )
            .asset(&url, b"png"),
    );

    let config = ConvertConfig::builder().build().unwrap();
    let driver = BatchDriver::new(service.clone() as Arc<dyn DocumentService>, config);
    let out = dir.path().join("out");
    let summary = driver.run(&inputs, &out).await;

    assert_eq!(summary.succeeded(), 1);
    let outcome = match &summary.results[0].outcome {
        ItemOutcome::Success(o) => o,
        other => panic!("expected success: {other:?}"),
    };
    assert!(outcome.asset_failures.is_empty());

    let text = std::fs::read_to_string(&outcome.output_paths[0]).unwrap();
    assert!(text.contains("images/inline_x0_y0_w10_h10.jpg"));
    assert!(!text.contains("cdn.mathpix.com"));
    assert_eq!(service.fetch_count(&url), 1);
}
