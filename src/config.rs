//! Configuration for the document pipeline.
//!
//! Every knob lives in one immutable [`PipelineConfig`], built through
//! [`PipelineConfigBuilder`] and handed to the
//! [`crate::orchestrator::Pipeline`] at construction. Nothing is read from
//! global state during a run, so two pipelines with different settings can
//! run side by side in one process.

use crate::aggregate::{ExpectationPolicy, PerPageBaseline};
use crate::error::PdfScanError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Lowest accepted rendering resolution.
pub const MIN_DPI: u32 = 72;
/// Highest accepted rendering resolution.
pub const MAX_DPI: u32 = 600;

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use pdfscan::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(200)
///     .concurrency(8)
///     .max_retries(5)
///     .output_dir("out")
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rendering DPI. Range: 72–600. Default: 300.
    ///
    /// Bounding boxes in the report are in pixels at this resolution.
    pub dpi: u32,

    /// LLM model identifier, e.g. "gpt-4.1", "claude-sonnet-4-20250514".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.5.
    ///
    /// Kept above zero so a regenerated reply after a validation failure can
    /// actually differ from the rejected one.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Total attempts per page for transport failures (timeouts, throttling,
    /// 5xx). Default: 3.
    pub max_retries: u32,

    /// Base backoff delay in milliseconds. Default: 2000.
    ///
    /// The wait after the n-th transport failure is `base × 2^(n-1)`.
    pub retry_base_delay_ms: u64,

    /// Extra requests allowed when a reply fails schema validation. Default: 1.
    ///
    /// Must stay below `max_retries`.
    pub max_validation_retries: u32,

    /// Per-attempt timeout for the remote call in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Pages (remote calls) in flight at once, across all documents. Default: 4.
    pub concurrency: usize,

    /// Documents processed at once in a batch. Default: 2.
    pub batch_size: usize,

    /// Directory receiving one `<stem>.json` report per document.
    /// Default: `processed_json`.
    pub output_dir: PathBuf,

    /// Root for per-job scratch directories. `None` uses the system temp dir.
    pub scratch_dir: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Replacement for the built-in extraction instruction.
    pub instruction: Option<String>,

    /// Normalisation denominator for completeness. Default: 8 per page.
    pub expectation: Arc<dyn ExpectationPolicy>,

    /// Optional per-document / per-page event sink.
    pub progress_callback: Option<ProgressCallback>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.5,
            max_tokens: 4096,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            max_validation_retries: 1,
            api_timeout_secs: 120,
            concurrency: 4,
            batch_size: 2,
            output_dir: PathBuf::from("processed_json"),
            scratch_dir: None,
            password: None,
            instruction: None,
            expectation: Arc::new(PerPageBaseline::default()),
            progress_callback: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("max_validation_retries", &self.max_validation_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("batch_size", &self.batch_size)
            .field("output_dir", &self.output_dir)
            .field("scratch_dir", &self.scratch_dir)
            .field("expectation", &self.expectation)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Backoff before the next attempt after `failures` transport failures.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << exp))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn max_validation_retries(mut self, n: u32) -> Self {
        self.config.max_validation_retries = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.max(1);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = Some(dir.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn instruction(mut self, text: impl Into<String>) -> Self {
        self.config.instruction = Some(text.into());
        self
    }

    pub fn expectation(mut self, policy: Arc<dyn ExpectationPolicy>) -> Self {
        self.config.expectation = policy;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PdfScanError> {
        let c = &self.config;
        if c.dpi < MIN_DPI || c.dpi > MAX_DPI {
            return Err(PdfScanError::InvalidConfig(format!(
                "DPI must be {MIN_DPI}–{MAX_DPI}, got {}",
                c.dpi
            )));
        }
        if c.max_retries == 0 {
            return Err(PdfScanError::InvalidConfig(
                "max_retries must be ≥ 1 (it counts the first attempt)".into(),
            ));
        }
        if c.max_validation_retries >= c.max_retries {
            return Err(PdfScanError::InvalidConfig(format!(
                "max_validation_retries ({}) must be smaller than max_retries ({})",
                c.max_validation_retries, c.max_retries
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(PdfScanError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = PipelineConfig::builder().build().expect("defaults valid");
        assert_eq!(config.dpi, 300);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_validation_retries, 1);
        assert_eq!(config.output_dir, PathBuf::from("processed_json"));
    }

    #[test]
    fn dpi_out_of_range_rejected() {
        assert!(PipelineConfig::builder().dpi(50).build().is_err());
        assert!(PipelineConfig::builder().dpi(601).build().is_err());
        assert!(PipelineConfig::builder().dpi(72).build().is_ok());
    }

    #[test]
    fn validation_budget_must_be_smaller() {
        let err = PipelineConfig::builder()
            .max_retries(2)
            .max_validation_retries(2)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_validation_retries"));
    }

    #[test]
    fn zero_retries_rejected() {
        assert!(PipelineConfig::builder()
            .max_retries(0)
            .max_validation_retries(0)
            .build()
            .is_err());
    }

    #[test]
    fn backoff_doubles() {
        let config = PipelineConfig::builder()
            .retry_base_delay_ms(500)
            .build()
            .unwrap();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn concurrency_floor_is_one() {
        let config = PipelineConfig::builder()
            .concurrency(0)
            .batch_size(0)
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.batch_size, 1);
    }
}
