//! # pdfscan
//!
//! Extract structured page components from PDF documents using Vision
//! Language Models (VLMs).
//!
//! Every page is rendered to an image at a fixed DPI and sent to a
//! vision-capable model, which returns the page's components: text blocks,
//! tables, images, headers and footers, each with its content, a confidence
//! score and a pixel bounding box. Replies are validated against that schema
//! before they are accepted. Pages are then folded into one JSON report per
//! document with per-type statistics, average confidence and a completeness
//! score.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     discover files by pattern, or resolve a path / URL
//!  ├─ 2. Render    rasterise one page at a time via pdfium (spawn_blocking)
//!  ├─ 3. Encode    scratch PNG → base64
//!  ├─ 4. Extract   bounded-concurrency VLM calls, schema validation, retry
//!  ├─ 5. Aggregate per-type counts, confidence, completeness
//!  └─ 6. Persist   <output_dir>/<stem>.json (temp file + rename)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfscan::{Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().output_dir("processed_json").build()?;
//!     let pipeline = Pipeline::from_config(config)?;
//!     let outcome = pipeline.process_directory(Path::new("pdfs"), "*.pdf", None).await?;
//!     let summary = outcome.summary();
//!     eprintln!("{} documents, {} components", summary.total_documents, summary.total_components);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfscan` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! pdfscan = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod aggregate;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use aggregate::{aggregate, summarize, BatchSummary, ExpectationPolicy, FixedTarget, PerPageBaseline};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{PageError, PdfScanError, ServiceError, ValidationError};
pub use model::{BoundingBox, Component, ComponentStatistics, ComponentType, DocumentReport, Job, PageResult};
pub use orchestrator::{BatchOutcome, CancelToken, DocumentFailure, Pipeline, ProcessedDocument};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use service::{EncodedImage, InferenceService, LlmService};
