//! Asset localization: make a converted document self-contained.
//!
//! Output documents reference figures through the service's CDN. Those links
//! rot when the server-side result is deleted, so after acquisition every
//! CDN reference is fetched once, persisted next to the document, and the
//! reference rewritten to a local relative path.
//!
//! Two properties matter here:
//!
//! * **One fetch per distinct URL.** The same asset commonly appears in the
//!   text form and again in the structured `lines.json` sibling, and can
//!   repeat within one form. Dedup is keyed by URL — the service issues
//!   stable URLs per asset, so content hashing would buy nothing.
//! * **Partial failure degrades, never aborts.** A dead asset leaves its
//!   reference pointing at the original URL and lands in the report's
//!   failure list; every other reference in every form is still rewritten.
//!
//! Filenames are derived deterministically from the URL (crop geometry from
//! the query string is folded into the name), so re-running against an
//! already-localized document fetches nothing and changes nothing.

use crate::client::DocumentService;
use crate::error::OcrError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One asset that could not be fetched. Non-fatal; the document keeps the
/// remote reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetFailure {
    pub url: String,
    pub detail: String,
}

/// One asset persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAsset {
    pub remote_url: String,
    pub local_path: PathBuf,
    pub byte_size: u64,
}

/// Result of one document's localization pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalizeReport {
    pub assets: Vec<LocalAsset>,
    pub failures: Vec<AssetFailure>,
    /// Total reference occurrences rewritten across all forms.
    pub rewritten: usize,
}

/// Rewrites service-hosted asset references in a document (and its
/// structured sibling forms) to local relative paths.
pub struct AssetLocalizer {
    service: Arc<dyn DocumentService>,
    prefix: String,
    markdown_ref: Regex,
    force: bool,
}

impl AssetLocalizer {
    /// `prefix` identifies service-hosted URLs; only references under it are
    /// touched. `force` re-fetches assets that already exist on disk.
    pub fn new(
        service: Arc<dyn DocumentService>,
        prefix: impl Into<String>,
        force: bool,
    ) -> Result<Self, OcrError> {
        let prefix = prefix.into();
        let markdown_ref = Regex::new(&format!(
            r"!\[[^\]]*\]\(({}[^)\s]*)\)",
            regex::escape(&prefix)
        ))
        .map_err(|e| OcrError::InvalidConfig(format!("asset URL prefix: {e}")))?;
        Ok(Self {
            service,
            prefix,
            markdown_ref,
            force,
        })
    }

    /// Localize every service-hosted asset referenced by `primary` or any
    /// of `siblings`, persisting fetched bytes under `asset_dir`.
    ///
    /// Documents are only rewritten after all fetches have been attempted;
    /// each write is atomic (temp file + rename), so an interrupted run
    /// never leaves a half-written document.
    pub async fn localize(
        &self,
        primary: &Path,
        siblings: &[PathBuf],
        asset_dir: &Path,
    ) -> Result<LocalizeReport, OcrError> {
        // 1. Read every form we can; a sibling that vanished is not fatal.
        let mut forms: Vec<(PathBuf, String)> = Vec::with_capacity(1 + siblings.len());
        for path in std::iter::once(primary.to_path_buf()).chain(siblings.iter().cloned()) {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => forms.push((path, text)),
                Err(e) if forms.is_empty() => {
                    // The primary form must exist.
                    return Err(OcrError::Internal(format!(
                        "reading {}: {e}",
                        path.display()
                    )));
                }
                Err(e) => warn!("Skipping unreadable sibling {}: {e}", path.display()),
            }
        }

        // 2. Extract references from all forms, deduplicated by URL in
        //    first-seen order.
        let mut seen = HashSet::new();
        let mut urls: Vec<String> = Vec::new();
        for (path, text) in &forms {
            let refs = if path.extension().is_some_and(|e| e == "json") {
                scan_urls(text, &self.prefix)
            } else {
                self.markdown_refs(text)
            };
            for url in refs {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }

        if urls.is_empty() {
            debug!("No service-hosted assets in {}", primary.display());
            return Ok(LocalizeReport::default());
        }

        tokio::fs::create_dir_all(asset_dir)
            .await
            .map_err(|e| OcrError::OutputWriteFailed {
                path: asset_dir.to_path_buf(),
                source: e,
            })?;

        // 3. Fetch each distinct URL exactly once. Already-present files
        //    suppress the fetch so repeated runs stay idempotent.
        let mut report = LocalizeReport::default();
        for url in &urls {
            let local_path = asset_dir.join(asset_filename(url));

            if !self.force {
                if let Ok(meta) = tokio::fs::metadata(&local_path).await {
                    debug!("Asset already present: {}", local_path.display());
                    report.assets.push(LocalAsset {
                        remote_url: url.clone(),
                        local_path,
                        byte_size: meta.len(),
                    });
                    continue;
                }
            }

            match self.service.fetch_asset(url).await {
                Ok(bytes) => {
                    let size = bytes.len() as u64;
                    write_atomic(&local_path, &bytes).await?;
                    debug!("Fetched {url} → {}", local_path.display());
                    report.assets.push(LocalAsset {
                        remote_url: url.clone(),
                        local_path,
                        byte_size: size,
                    });
                }
                Err(e) => {
                    warn!("Failed to fetch {url}: {e}");
                    report.failures.push(AssetFailure {
                        url: url.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        // 4. Rewrite successful references in every form. Longest URL first
        //    so a URL that is a prefix of another cannot clobber it.
        let mut fetched: Vec<&LocalAsset> = report.assets.iter().collect();
        fetched.sort_by_key(|a| std::cmp::Reverse(a.remote_url.len()));

        for (path, text) in &mut forms {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let mut updated = text.clone();
            for asset in &fetched {
                let rel = relative_reference(parent, &asset.local_path);
                let occurrences = updated.matches(asset.remote_url.as_str()).count();
                if occurrences > 0 {
                    updated = updated.replace(asset.remote_url.as_str(), &rel);
                    report.rewritten += occurrences;
                }
            }
            if updated != *text {
                write_atomic(path, updated.as_bytes()).await?;
            }
        }

        info!(
            "Localized {} asset(s) for {} ({} reference(s) rewritten, {} failed)",
            report.assets.len(),
            primary.display(),
            report.rewritten,
            report.failures.len()
        );
        Ok(report)
    }

    fn markdown_refs(&self, text: &str) -> Vec<String> {
        self.markdown_ref
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect()
    }
}

/// Scan raw text for URLs under `prefix`, stopping at characters that
/// cannot appear inside the service's asset URLs. Used for JSON forms,
/// where references are plain string values rather than Markdown images.
fn scan_urls(text: &str, prefix: &str) -> Vec<String> {
    const TERMINATORS: &[char] = &['"', '\'', ')', ']', '}', '<', '>', '\\'];
    let mut urls = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(prefix) {
        let tail = &rest[pos..];
        let end = tail
            .find(|c: char| c.is_whitespace() || TERMINATORS.contains(&c))
            .unwrap_or(tail.len());
        urls.push(tail[..end].to_string());
        rest = &rest[pos + end.max(1)..];
    }
    urls
}

/// Derive a deterministic local filename from an asset URL.
///
/// Crop-geometry query parameters become part of the name (the same source
/// image is served in many crops, all sharing one path segment); any other
/// query string is folded in via a short digest so distinct variants never
/// collide.
pub fn asset_filename(url: &str) -> String {
    let parsed = match url::Url::parse(url) {
        Ok(u) => u,
        Err(_) => {
            let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
            return format!("{}.bin", &digest[..20]);
        }
    };

    let last = parsed
        .path_segments()
        .and_then(|mut s| s.next_back().map(|v| v.to_string()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "asset".to_string());

    let (stem, ext) = match last.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
        _ => (last.clone(), String::new()),
    };

    let query: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
    let geometry = ["top_left_x", "top_left_y", "width", "height"]
        .iter()
        .map(|k| query.get(*k))
        .collect::<Option<Vec<_>>>();

    match geometry {
        Some(g) => format!("{stem}_x{}_y{}_w{}_h{}{ext}", g[0], g[1], g[2], g[3]),
        None => match parsed.query() {
            Some(q) if !q.is_empty() => {
                let digest = Sha256::digest(q.as_bytes());
                format!("{stem}_{}{ext}", &format!("{digest:x}")[..8])
            }
            _ => last,
        },
    }
}

/// Relative path string for referencing `target` from a document in `from`.
fn relative_reference(from: &Path, target: &Path) -> String {
    match target.strip_prefix(from) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => target.to_string_lossy().into_owned(),
    }
}

/// Write `bytes` to `path` through a temp file + rename, so readers never
/// observe a partially written file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), OcrError> {
    let err = |source| OcrError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(err)?;
    }

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes).await.map_err(err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(err)?;
    Ok(())
}
