//! Job orchestration: documents in, one JSON report per document out.
//!
//! ## Concurrency model
//!
//! ```text
//! process_batch ──buffered(batch_size)──▶ process_document ──buffer_unordered(concurrency)──▶ process_page
//!                                                                                          │
//!                                                         Semaphore(concurrency) ◀─────────┘
//! ```
//!
//! Page work (render, encode, remote call) holds a permit from one semaphore
//! shared by every document of the pipeline, so `concurrency` bounds the
//! remote calls and the rasters in flight for the whole run, however many
//! documents are open at once.
//!
//! Pages finish in any order; [`crate::aggregate::aggregate`] sorts them
//! before the report is written.
//!
//! ## Failure containment
//!
//! * A page that cannot be rendered or extracted becomes an empty page plus a
//!   [`PageError`]; its siblings are unaffected.
//! * A document that cannot be opened or persisted becomes a
//!   [`DocumentFailure`]; the rest of the batch continues.
//!
//! ## Cancellation
//!
//! After [`CancelToken::cancel`], no new document starts and no new remote
//! call is issued. A document that was already running still writes its
//! report; pages that never reached the service are recorded as empty and
//! reported as [`PageError::Cancelled`].

use crate::aggregate::{aggregate, summarize, BatchSummary};
use crate::config::PipelineConfig;
use crate::error::{PageError, PdfScanError};
use crate::model::{DocumentReport, Job, PageResult};
use crate::pipeline::encode::encode_page;
use crate::pipeline::extract::extract_page;
use crate::pipeline::input::{discover_sources, resolve_source, SourceInput};
use crate::pipeline::render::{PageSequence, PdfiumRasterizer, Rasterizer};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::service::{InferenceService, LlmService};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

/// Cooperative cancellation flag shared between the caller and the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one successfully persisted document.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub report: DocumentReport,
    /// Where the report was written.
    pub output_path: PathBuf,
    /// Pages that contributed zero components because they failed, by page.
    pub page_errors: Vec<PageError>,
}

/// A document skipped as a whole.
#[derive(Debug)]
pub struct DocumentFailure {
    /// Input as given (path or URL).
    pub source: String,
    pub error: PdfScanError,
}

/// Everything a batch produced.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Persisted documents, in input order.
    pub documents: Vec<ProcessedDocument>,
    pub failures: Vec<DocumentFailure>,
    /// Inputs never started because the batch was cancelled.
    pub cancelled: Vec<String>,
}

impl BatchOutcome {
    pub fn summary(&self) -> BatchSummary {
        summarize(self.documents.iter().map(|d| &d.report))
    }

    /// The run as a whole failed: a run-level error reached a document, or
    /// every attempted document failed.
    pub fn run_failed(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_fatal_to_run())
            || (self.documents.is_empty() && !self.failures.is_empty())
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
            && self.cancelled.is_empty()
            && self.documents.iter().all(|d| d.page_errors.is_empty())
    }
}

/// Drives documents through render → encode → extract → aggregate → persist.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    service: Arc<dyn InferenceService>,
    rasterizer: Arc<dyn Rasterizer>,
    permits: Arc<Semaphore>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        service: Arc<dyn InferenceService>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config: Arc::new(config),
            service,
            rasterizer,
            permits,
            cancel: CancelToken::new(),
        }
    }

    /// Production pipeline: pdfium rasteriser and an `edgequake_llm` provider.
    ///
    /// Fails with [`PdfScanError::ProviderNotConfigured`] when no provider can
    /// be resolved; that error ends the run before any document starts.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PdfScanError> {
        let service = LlmService::from_config(&config)?;
        info!("Using inference service: {}", service.name());
        let rasterizer = PdfiumRasterizer::new(config.password.clone());
        Ok(Self::new(config, Arc::new(service), Arc::new(rasterizer)))
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn callback(&self) -> ProgressCallback {
        self.config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback))
    }

    /// Process every file in `dir` matching `pattern`, up to `limit`.
    pub async fn process_directory(
        &self,
        dir: &Path,
        pattern: &str,
        limit: Option<usize>,
    ) -> Result<BatchOutcome, PdfScanError> {
        let sources = discover_sources(dir, pattern, limit)?;
        let inputs: Vec<String> = sources
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        Ok(self.process_batch(inputs).await)
    }

    /// Process a list of inputs (paths or URLs), `batch_size` at a time.
    ///
    /// Never fails as a whole: per-document errors are collected in the
    /// returned [`BatchOutcome`].
    pub async fn process_batch<I, S>(&self, inputs: I) -> BatchOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inputs: Vec<String> = inputs.into_iter().map(|s| s.as_ref().to_string()).collect();
        let callback = self.callback();
        callback.on_batch_start(inputs.len());
        let start = Instant::now();
        info!("Starting batch of {} documents", inputs.len());

        let results: Vec<(String, Result<ProcessedDocument, PdfScanError>)> =
            stream::iter(inputs.into_iter().map(|input| async move {
                let result = self.process_document(&input).await;
                if let Err(ref e) = result {
                    if e.is_fatal_to_run() {
                        warn!("Stopping batch: {}", e);
                        self.cancel.cancel();
                    }
                }
                (input, result)
            }))
            .buffered(self.config.batch_size.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (input, result) in results {
            match result {
                Ok(doc) => outcome.documents.push(doc),
                Err(PdfScanError::Cancelled) => outcome.cancelled.push(input),
                Err(error) => outcome.failures.push(DocumentFailure {
                    source: input,
                    error,
                }),
            }
        }

        info!(
            "Batch finished in {:.1}s: {} processed, {} failed, {} cancelled",
            start.elapsed().as_secs_f64(),
            outcome.documents.len(),
            outcome.failures.len(),
            outcome.cancelled.len()
        );
        callback.on_batch_complete(outcome.documents.len(), outcome.failures.len());
        outcome
    }

    /// Process one document end to end and persist its report.
    ///
    /// Page failures do not fail the document; they show up as empty pages
    /// and in [`ProcessedDocument::page_errors`].
    pub async fn process_document(&self, input: &str) -> Result<ProcessedDocument, PdfScanError> {
        if self.cancel.is_cancelled() {
            return Err(PdfScanError::Cancelled);
        }

        let result = self.open_and_run(input).await;
        if let Err(ref e) = result {
            warn!("Skipping {}: {}", input, e);
            self.callback().on_document_error(display_name(input), &e.to_string());
        }
        result
    }

    async fn open_and_run(&self, input: &str) -> Result<ProcessedDocument, PdfScanError> {
        let source = resolve_source(input, self.config.download_timeout_secs).await?;
        let job = Job::new(source.path());
        let span = info_span!("job", job_id = %job.id, file = %job.filename);
        self.run_job(job, source).instrument(span).await
    }

    async fn run_job(&self, job: Job, source: SourceInput) -> Result<ProcessedDocument, PdfScanError> {
        let start = Instant::now();
        let callback = self.callback();
        let scratch = self.scratch_area(&job)?;

        let pages = PageSequence::open(
            Arc::clone(&self.rasterizer),
            source.path(),
            scratch.path(),
            self.config.dpi,
        )
        .await?;
        let total_pages = pages.len();
        info!("Processing {} ({} pages)", job.filename, total_pages);
        callback.on_document_start(&job.filename, total_pages);

        let outcomes: Vec<(PageResult, Option<PageError>)> = stream::iter(1..=total_pages)
            .map(|page_number| {
                self.process_page(&job, &pages, page_number)
                    .instrument(info_span!("page", page = page_number))
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut results = Vec::with_capacity(total_pages);
        let mut page_errors = Vec::new();
        for (page, error) in outcomes {
            results.push(page);
            page_errors.extend(error);
        }
        page_errors.sort_by_key(PageError::page);

        let report = aggregate(&job, results, self.config.expectation.as_ref());
        let output_path = self.persist(&report).await?;

        if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch directory: {}", e);
        }

        info!(
            "Completed {} in {:.1}s: {} components over {} pages, completeness {:.2}, {} failed pages",
            job.filename,
            start.elapsed().as_secs_f64(),
            report.total_components,
            report.total_pages,
            report.completeness,
            page_errors.len()
        );
        callback.on_document_complete(&job.filename, report.total_components, report.completeness);

        Ok(ProcessedDocument {
            report,
            output_path,
            page_errors,
        })
    }

    /// Render, encode and extract one page. Always yields a page result.
    async fn process_page(
        &self,
        job: &Job,
        pages: &PageSequence,
        page_number: usize,
    ) -> (PageResult, Option<PageError>) {
        let outcome = self.try_process_page(pages, page_number).await;
        let callback = self.callback();
        match outcome {
            Ok(page) => {
                callback.on_page_complete(&job.filename, page_number, page.component_count);
                (page, None)
            }
            Err(error) => {
                if !matches!(error, PageError::Cancelled { .. }) {
                    warn!("{}", error);
                }
                callback.on_page_error(&job.filename, page_number, &error.to_string());
                (PageResult::empty(page_number), Some(error))
            }
        }
    }

    async fn try_process_page(
        &self,
        pages: &PageSequence,
        page_number: usize,
    ) -> Result<PageResult, PageError> {
        let cancelled = || PageError::Cancelled { page: page_number };
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        let _permit = self.permits.acquire().await.map_err(|_| cancelled())?;
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let render_failed = |e: PdfScanError| PageError::RenderFailed {
            page: page_number,
            detail: e.to_string(),
        };
        let image = pages.page(page_number).await.map_err(render_failed)?;
        let encoded = encode_page(&image).await.map_err(render_failed)?;
        if let Err(e) = image.release() {
            debug!("Scratch image for page {} not removed: {}", page_number, e);
        }

        extract_page(
            self.service.as_ref(),
            &encoded,
            page_number,
            &self.config,
            &self.cancel,
        )
        .await
    }

    /// Per-job scratch directory, removed when the returned guard drops.
    fn scratch_area(&self, job: &Job) -> Result<TempDir, PdfScanError> {
        let short_id: String = job.id.chars().take(8).collect();
        let prefix = format!("pdfscan-{short_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);

        let created = match self.config.scratch_dir {
            Some(ref root) => {
                std::fs::create_dir_all(root).map_err(|source| PdfScanError::ScratchUnavailable {
                    path: root.clone(),
                    source,
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        created.map_err(|source| PdfScanError::ScratchUnavailable {
            path: self
                .config
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            source,
        })
    }

    /// Write `<output_dir>/<stem>.json` via a temp file and rename, so a
    /// crash never leaves a truncated report behind.
    async fn persist(&self, report: &DocumentReport) -> Result<PathBuf, PdfScanError> {
        let path = report_path(&self.config.output_dir, &report.filename);
        let write_failed = |source: std::io::Error| PdfScanError::OutputWriteFailed {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(write_failed)?;

        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| PdfScanError::Internal(format!("Failed to serialise report: {e}")))?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await.map_err(write_failed)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(write_failed)?;

        info!("Saved report to {}", path.display());
        Ok(path)
    }
}

/// `<output_dir>/<stem>.json` for a source file name.
pub fn report_path(output_dir: &Path, filename: &str) -> PathBuf {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string());
    output_dir.join(format!("{stem}.json"))
}

fn display_name(input: &str) -> &str {
    input
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_path_uses_stem() {
        let dir = Path::new("out");
        assert_eq!(report_path(dir, "tender.pdf"), PathBuf::from("out/tender.json"));
        assert_eq!(report_path(dir, "a.b.pdf"), PathBuf::from("out/a.b.json"));
        assert_eq!(report_path(dir, ""), PathBuf::from("out/document.json"));
    }

    #[test]
    fn display_name_is_last_segment() {
        assert_eq!(display_name("/data/in/report.pdf"), "report.pdf");
        assert_eq!(display_name("https://x.org/a/b.pdf"), "b.pdf");
        assert_eq!(display_name("plain.pdf"), "plain.pdf");
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    fn failure(error: PdfScanError) -> DocumentFailure {
        DocumentFailure {
            source: "in.pdf".into(),
            error,
        }
    }

    #[test]
    fn run_fails_on_run_level_error_or_total_failure() {
        let mut outcome = BatchOutcome::default();
        assert!(!outcome.run_failed());

        outcome.failures.push(failure(PdfScanError::SourceUnreadable {
            path: PathBuf::from("in.pdf"),
            detail: "bad xref".into(),
        }));
        assert!(outcome.run_failed(), "every attempted document failed");

        let report = crate::aggregate::aggregate(
            &Job::new(Path::new("ok.pdf")),
            vec![PageResult::empty(1)],
            &crate::aggregate::FixedTarget(1),
        );
        outcome.documents.push(ProcessedDocument {
            report,
            output_path: PathBuf::from("out/ok.json"),
            page_errors: Vec::new(),
        });
        assert!(!outcome.run_failed(), "partial failure is not a run failure");

        outcome
            .failures
            .push(failure(PdfScanError::InvalidConfig("dpi".into())));
        assert!(outcome.run_failed());
    }

    #[test]
    fn empty_outcome_summary() {
        let outcome = BatchOutcome::default();
        assert!(outcome.is_complete_success());
        assert_eq!(outcome.summary().total_documents, 0);
    }
}
