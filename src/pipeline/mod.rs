//! Per-page pipeline stages.
//!
//! Each submodule implements exactly one transformation step, so each can be
//! tested alone and a backend can be swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ extract
//! (path/URL) (pdfium)  (base64)   (service + validation + retry)
//! ```
//!
//! 1. [`input`]   — discover sources in a directory, or resolve a path/URL
//! 2. [`render`]  — rasterise one page into a scratch PNG; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]  — base64-wrap the PNG for the request body
//! 4. [`extract`] — the only stage with network I/O: call the service,
//!    validate the reply against the component schema, retry
//!
//! Aggregation and persistence happen once per document in
//! [`crate::orchestrator`].

pub mod encode;
pub mod extract;
pub mod input;
pub mod render;
