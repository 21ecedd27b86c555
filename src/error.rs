//! Error types for the pdfscan library.
//!
//! Four error types map onto the four levels at which something can go wrong:
//!
//! * [`PdfScanError`] — **Fatal for a document (or the run)**: the source
//!   cannot be opened, the provider is not configured, the report cannot be
//!   written. Returned as `Err(PdfScanError)` from the orchestrator.
//!
//! * [`PageError`] — **Non-fatal**: a single page could not be rendered or
//!   extracted. The page is recorded with zero components and the error is
//!   kept in [`crate::orchestrator::ProcessedDocument::page_errors`].
//!
//! * [`ServiceError`] — a single remote call failed. Transient variants are
//!   retried with exponential backoff.
//!
//! * [`ValidationError`] — the remote call succeeded but its reply does not
//!   match the component schema. Retried on a separate, smaller budget.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors returned by the pdfscan library.
///
/// Page-level failures use [`PageError`] and never surface here.
#[derive(Debug, Error)]
pub enum PdfScanError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The document cannot be opened or parsed at all.
    #[error("Cannot read source document '{path}': {detail}")]
    SourceUnreadable { path: PathBuf, detail: String },

    /// A page index outside `0..total` was requested from the rasteriser.
    #[error("Page index {index} is out of range (document has {total} pages)")]
    InvalidPageIndex { index: usize, total: usize },

    /// pdfium-render failed on a page that does exist.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// HTTP URL input could not be downloaded.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    // ── Service errors ────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the JSON report.
    #[error("Failed to write report '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create the scratch area for page images.
    #[error("Failed to prepare scratch directory '{path}': {source}")]
    ScratchUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The batch was cancelled before this document started.
    #[error("Processing cancelled")]
    Cancelled,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PdfScanError {
    /// Whether this error ends the whole run rather than a single document.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            PdfScanError::ProviderNotConfigured { .. } | PdfScanError::InvalidConfig(_)
        )
    }
}

/// A failed call to the remote inference service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// Network failure or transient server error (5xx).
    #[error("transport error: {0}")]
    Transport(String),

    /// The service signalled throttling / rate limiting.
    #[error("throttled by service{}", .retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    Throttle { retry_after_secs: Option<u64> },

    /// The attempt exceeded its per-call timeout.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The service refused the request (bad credentials, invalid request).
    /// Retrying the same request cannot help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// Transport, throttle and timeout failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServiceError::Rejected(_))
    }
}

/// A decoded reply that does not satisfy the component schema.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("reply contains no JSON object or array")]
    NoJson,

    #[error("reply is not valid component JSON: {0}")]
    Malformed(String),

    #[error("component '{id}' has unknown type '{kind}'")]
    UnknownType { id: String, kind: String },

    #[error("component '{id}' has confidence {value} outside [0, 1]")]
    ConfidenceOutOfRange { id: String, value: f64 },

    #[error("component '{id}' has invalid bounding box {bbox:?}")]
    InvalidBoundingBox { id: String, bbox: [f64; 4] },

    #[error("component id '{0}' appears more than once on the page")]
    DuplicateComponentId(String),

    #[error("component at position {0} has an empty component_id")]
    EmptyComponentId(usize),
}

/// A non-fatal error for a single page.
///
/// The page contributes zero components to the report; the document continues.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize, PartialEq)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Extraction failed after every retry was spent.
    #[error("Page {page}: extraction failed after {attempts} attempts: {detail}")]
    ExtractionFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The batch was cancelled before an extraction call was issued.
    #[error("Page {page}: cancelled before extraction")]
    Cancelled { page: usize },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::ExtractionFailed { page, .. }
            | PageError::Cancelled { page } => *page,
        }
    }
}
