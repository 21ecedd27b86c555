//! Progress-callback trait for document and page events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events while a batch runs. The CLI uses it to drive a progress bar; library
//! callers can forward events anywhere (channel, database, log).
//!
//! Pages and documents are processed concurrently, so every method may be
//! called from several tasks at once.

use std::sync::Arc;

/// Receives pipeline events. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// A batch of `total_documents` is about to start.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// A document has been opened and has `total_pages` pages.
    fn on_document_start(&self, filename: &str, total_pages: usize) {
        let _ = (filename, total_pages);
    }

    /// A page produced `component_count` validated components.
    fn on_page_complete(&self, filename: &str, page_number: usize, component_count: usize) {
        let _ = (filename, page_number, component_count);
    }

    /// A page ended with zero components because of `error`.
    fn on_page_error(&self, filename: &str, page_number: usize, error: &str) {
        let _ = (filename, page_number, error);
    }

    /// The report for `filename` was written.
    fn on_document_complete(&self, filename: &str, total_components: usize, completeness: f64) {
        let _ = (filename, total_components, completeness);
    }

    /// The document was skipped as a whole.
    fn on_document_error(&self, filename: &str, error: &str) {
        let _ = (filename, error);
    }

    /// Every document has been attempted.
    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        let _ = (succeeded, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
