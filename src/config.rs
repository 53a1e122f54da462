//! Configuration types for remote-OCR conversion.
//!
//! All pipeline behaviour is controlled through [`ConvertConfig`], built via
//! its [`ConvertConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, serialise them for logging, and
//! diff two runs to understand why their outputs differ. Each in-flight
//! document gets the config by value — there is no process-wide mutable
//! options state, so concurrent documents can never observe each other's
//! settings.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder pattern lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::OcrError;
use crate::naming::NamingPolicy;
use serde::{Deserialize, Serialize};

/// Configuration for one conversion run (single document or batch).
///
/// Built via [`ConvertConfig::builder()`] or using
/// [`ConvertConfig::default()`].
///
/// # Example
/// ```rust
/// use ocr2md::ConvertConfig;
///
/// let config = ConvertConfig::builder()
///     .concurrency(2)
///     .skip_status_check(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// Prefer the live page-event stream over status polling. Default: true.
    ///
    /// Streaming delivers pages as the service finishes them, typically
    /// cutting wall-clock time for long documents roughly in half. When the
    /// stream drops before all pages arrive, the acquirer falls back to
    /// polling automatically — disabling this flag skips the stream entirely
    /// and goes straight to the polling + full-download path.
    pub streaming: bool,

    /// Skip the status double-check after a stream ends early. Default: false.
    ///
    /// Trades a small risk of silently truncated output (pages lost if the
    /// stream dropped without the acquirer noticing) for reduced latency.
    /// The distinct-page count is still tracked and reported on the outcome
    /// regardless of this flag, so truncation is at least detectable.
    pub skip_status_check: bool,

    /// Interval between status polls in seconds. Default: 5.
    pub poll_interval_secs: u64,

    /// Maximum total time to spend polling before giving up. Default: 300.
    ///
    /// Exceeding this bound while the status stays non-terminal fails that
    /// document with a `Timeout` kind — distinct from a `Remote` failure
    /// where the service itself reported an error.
    pub max_poll_secs: u64,

    /// Consecutive poll transport failures tolerated before giving up.
    /// Default: 3.
    ///
    /// A successful poll resets the counter; this bounds retries against a
    /// flapping network without ever retrying mid-stream.
    pub max_poll_failures: u32,

    /// Number of documents processed simultaneously. Default: 4.
    ///
    /// The pipeline is network-bound; single-digit concurrency respects the
    /// remote service's rate limits while still overlapping submissions.
    /// Lower this if the service starts rejecting submissions under load.
    pub concurrency: usize,

    /// Additional output formats downloaded after completion. Default: none.
    ///
    /// The primary Markdown text (`.mmd`) is always produced — it is what
    /// the stream carries. Entries here are fetched via the download
    /// endpoint once processing completes.
    pub extra_formats: Vec<OutputFormat>,

    /// Rewrite remote image references to local files. Default: true.
    pub localize_images: bool,

    /// Re-fetch assets and overwrite outputs that already exist.
    /// Default: false.
    pub force: bool,

    /// Delete the server-side result after a successful run. Default: false.
    pub delete_remote: bool,

    /// How output subtrees are named; see [`NamingPolicy`].
    /// Default: stable content digest.
    pub naming: NamingPolicy,

    /// Options forwarded to the service at submission time.
    pub submit: SubmitOptions,

    /// Submission upload timeout in seconds. Default: 120.
    pub submit_timeout_secs: u64,

    /// Per-status-poll timeout in seconds. Default: 30.
    pub status_timeout_secs: u64,

    /// Stream read timeout in seconds. Default: 300.
    pub stream_timeout_secs: u64,

    /// Full-download timeout in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Per-asset fetch timeout in seconds. Default: 10.
    pub asset_timeout_secs: u64,

    /// URL prefix identifying service-hosted assets inside output documents.
    /// Only references under this prefix are localized.
    pub asset_url_prefix: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            skip_status_check: false,
            poll_interval_secs: 5,
            max_poll_secs: 300,
            max_poll_failures: 3,
            concurrency: 4,
            extra_formats: Vec::new(),
            localize_images: true,
            force: false,
            delete_remote: false,
            naming: NamingPolicy::default(),
            submit: SubmitOptions::default(),
            submit_timeout_secs: 120,
            status_timeout_secs: 30,
            stream_timeout_secs: 300,
            download_timeout_secs: 60,
            asset_timeout_secs: 10,
            asset_url_prefix: "https://cdn.mathpix.com/cropped".to_string(),
        }
    }
}

impl ConvertConfig {
    /// Create a new builder for `ConvertConfig`.
    pub fn builder() -> ConvertConfigBuilder {
        ConvertConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ConvertConfig`].
#[derive(Debug)]
pub struct ConvertConfigBuilder {
    config: ConvertConfig,
}

impl ConvertConfigBuilder {
    pub fn streaming(mut self, v: bool) -> Self {
        self.config.streaming = v;
        self
    }

    pub fn skip_status_check(mut self, v: bool) -> Self {
        self.config.skip_status_check = v;
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval_secs = secs.max(1);
        self
    }

    pub fn max_poll_secs(mut self, secs: u64) -> Self {
        self.config.max_poll_secs = secs;
        self
    }

    pub fn max_poll_failures(mut self, n: u32) -> Self {
        self.config.max_poll_failures = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn extra_formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.config.extra_formats = formats;
        self
    }

    pub fn localize_images(mut self, v: bool) -> Self {
        self.config.localize_images = v;
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn delete_remote(mut self, v: bool) -> Self {
        self.config.delete_remote = v;
        self
    }

    pub fn naming(mut self, policy: NamingPolicy) -> Self {
        self.config.naming = policy;
        self
    }

    pub fn submit_options(mut self, options: SubmitOptions) -> Self {
        self.config.submit = options;
        self
    }

    pub fn submit_timeout_secs(mut self, secs: u64) -> Self {
        self.config.submit_timeout_secs = secs;
        self
    }

    pub fn stream_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stream_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn asset_timeout_secs(mut self, secs: u64) -> Self {
        self.config.asset_timeout_secs = secs;
        self
    }

    pub fn asset_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.asset_url_prefix = prefix.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConvertConfig, OcrError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(OcrError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.poll_interval_secs > c.max_poll_secs {
            return Err(OcrError::InvalidConfig(format!(
                "Poll interval ({}s) exceeds the maximum wait bound ({}s)",
                c.poll_interval_secs, c.max_poll_secs
            )));
        }
        if c.extra_formats.contains(&OutputFormat::Mmd) {
            return Err(OcrError::InvalidConfig(
                "The primary .mmd output is always produced; do not list it in extra_formats"
                    .into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for f in &c.extra_formats {
            if !seen.insert(*f) {
                return Err(OcrError::InvalidConfig(format!(
                    "Duplicate output format: {}",
                    f.extension()
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// A named output format the service can produce for a completed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Markdown with math extensions — the primary text form; also what the
    /// page-event stream carries.
    Mmd,
    /// Plain Markdown.
    Md,
    /// Word document (binary).
    Docx,
    /// Structured per-line JSON referencing the same assets as the text form.
    LinesJson,
}

impl OutputFormat {
    /// File extension as used both on disk and in the download endpoint path.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mmd => "mmd",
            OutputFormat::Md => "md",
            OutputFormat::Docx => "docx",
            OutputFormat::LinesJson => "lines.json",
        }
    }

    /// Whether this format is text that can carry asset references.
    pub fn is_text(&self) -> bool {
        !matches!(self, OutputFormat::Docx)
    }

    /// Parse a CLI-supplied format name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mmd" => Some(OutputFormat::Mmd),
            "md" | "markdown" => Some(OutputFormat::Md),
            "docx" => Some(OutputFormat::Docx),
            "lines.json" | "lines" => Some(OutputFormat::LinesJson),
            _ => None,
        }
    }
}

/// Options forwarded verbatim to the service at submission time.
///
/// An explicit struct with documented defaults rather than a free-form
/// key-value map: the recognised options are enumerated here, and adding one
/// is a source change, not a stringly-typed convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Delimiters the service should use for inline math. Default: `$ … $`.
    pub math_inline_delimiters: [String; 2],

    /// Collapse redundant whitespace in recognised text. Default: true.
    pub rm_spaces: bool,

    /// Emit `\tag{…}` equation numbers where the source has them.
    /// Default: true.
    pub include_equation_tags: bool,

    /// Restrict processing to a page range expression (e.g. `"1-5"`).
    /// Default: all pages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_ranges: Option<String>,

    /// Ask the service to publish page events on the stream endpoint.
    /// Set by the pipeline from [`ConvertConfig::streaming`]; callers should
    /// leave the default.
    pub streaming: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            math_inline_delimiters: ["$".to_string(), "$".to_string()],
            rm_spaces: true,
            include_equation_tags: true,
            page_ranges: None,
            streaming: false,
        }
    }
}

impl SubmitOptions {
    /// Copy of these options with the streaming flag set.
    pub fn with_streaming(&self, streaming: bool) -> Self {
        Self {
            streaming,
            ..self.clone()
        }
    }
}
