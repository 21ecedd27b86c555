//! The remote inference capability and its production implementation.
//!
//! The pipeline only ever sees [`InferenceService`]: `invoke(image,
//! instruction) -> raw reply`. Retry, backoff and validation live in
//! [`crate::pipeline::extract`], so a deterministic fake is enough to test
//! them without the network.

use crate::config::PipelineConfig;
use crate::error::{PdfScanError, ServiceError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// A page image ready for the request body.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    /// Base64 payload, no data-URI prefix.
    pub data: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Something that turns (image, instruction) into a raw text reply.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Send one request. Transient conditions must map to the retryable
    /// [`ServiceError`] variants.
    async fn invoke(&self, image: &EncodedImage, instruction: &str) -> Result<String, ServiceError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// [`InferenceService`] over any vision-capable `edgequake_llm` provider.
pub struct LlmService {
    provider: Arc<dyn LLMProvider>,
    label: String,
    options: CompletionOptions,
}

impl LlmService {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            label: label.into(),
            options: build_options(config),
        }
    }

    /// Resolve the provider from configuration, from most to least specific:
    ///
    /// 1. a pre-built provider (`config.provider`);
    /// 2. a named provider plus optional model;
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` in the environment;
    /// 4. OpenAI when `OPENAI_API_KEY` is set;
    /// 5. auto-detection from API key variables.
    ///
    /// A configured model is never dropped: when it cannot be paired with a
    /// provider, resolution fails instead of falling through to step 5.
    /// Credentials themselves are read by `edgequake_llm`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PdfScanError> {
        if let Some(ref provider) = config.provider {
            return Ok(Self::new(Arc::clone(provider), "custom", config));
        }

        if let Some((name, model)) = select_provider(config, |key| std::env::var(key).ok())? {
            let provider = create_vision_provider(&name, &model)?;
            return Ok(Self::new(provider, format!("{name}/{model}"), config));
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| PdfScanError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No LLM provider could be auto-detected from environment.\n\
                    Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                    Error: {e}"
                ),
            })?;
        Ok(Self::new(provider, "auto", config))
    }
}

/// Pick `(provider, model)` from configuration and environment.
///
/// `Ok(None)` means "let the factory auto-detect", which only happens when no
/// model was configured.
fn select_provider(
    config: &PipelineConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Option<(String, String)>, PdfScanError> {
    let set = |key: &str| env(key).filter(|v| !v.is_empty());

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return Ok(Some((name.clone(), model.to_string())));
    }

    if let Some(prov) = set("EDGEQUAKE_LLM_PROVIDER") {
        if let Some(model) = config.model.clone().or_else(|| set("EDGEQUAKE_MODEL")) {
            return Ok(Some((prov, model)));
        }
    }

    if set("OPENAI_API_KEY").is_some() {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return Ok(Some(("openai".to_string(), model.to_string())));
    }

    match config.model {
        Some(ref model) => Err(PdfScanError::InvalidConfig(format!(
            "model '{model}' was requested but no provider is selected; \
             pass --provider or set EDGEQUAKE_LLM_PROVIDER"
        ))),
        None => Ok(None),
    }
}

#[async_trait]
impl InferenceService for LlmService {
    async fn invoke(&self, image: &EncodedImage, instruction: &str) -> Result<String, ServiceError> {
        let image_data = ImageData::new(image.data.clone(), image.mime_type.clone()).with_detail("high");
        let messages = vec![
            ChatMessage::system(instruction),
            ChatMessage::user_with_images("", vec![image_data]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.label, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Build `CompletionOptions` from the pipeline config.
fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PdfScanError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PdfScanError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

static RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry[- _]?after\D{0,5}(\d+)").expect("valid regex"));

static THROTTLE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b429\b").expect("valid regex"));

static REJECTED_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b40[13]\b").expect("valid regex"));

/// Map a provider error message onto the retry taxonomy.
///
/// Providers disagree on error types, but they all put the HTTP status or a
/// recognisable phrase in the message.
pub fn classify_provider_error(message: &str) -> ServiceError {
    let lower = message.to_lowercase();

    const THROTTLE_PHRASES: [&str; 6] = [
        "rate limit",
        "rate_limit",
        "ratelimit",
        "throttl",
        "too many requests",
        "overloaded",
    ];
    const REJECT_PHRASES: [&str; 7] = [
        "unauthorized",
        "authentication",
        "invalid api key",
        "invalid_api_key",
        "permission denied",
        "content_filter",
        "not configured",
    ];

    let throttled =
        THROTTLE_STATUS.is_match(message) || THROTTLE_PHRASES.iter().any(|p| lower.contains(p));
    if throttled {
        let retry_after_secs = RETRY_AFTER
            .captures(message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        return ServiceError::Throttle { retry_after_secs };
    }

    let rejected =
        REJECTED_STATUS.is_match(message) || REJECT_PHRASES.iter().any(|p| lower.contains(p));
    if rejected {
        return ServiceError::Rejected(message.to_string());
    }

    ServiceError::Transport(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages_are_throttles() {
        assert_eq!(
            classify_provider_error("HTTP 429 Too Many Requests"),
            ServiceError::Throttle {
                retry_after_secs: None
            }
        );
        assert_eq!(
            classify_provider_error("ThrottlingException: Rate exceeded, retry-after: 12"),
            ServiceError::Throttle {
                retry_after_secs: Some(12)
            }
        );
    }

    #[test]
    fn auth_messages_are_rejected() {
        let e = classify_provider_error("API error 401: invalid api key");
        assert!(matches!(e, ServiceError::Rejected(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn everything_else_is_transport() {
        let e = classify_provider_error("connection reset by peer");
        assert_eq!(e, ServiceError::Transport("connection reset by peer".into()));
        assert!(e.is_retryable());
    }

    #[test]
    fn status_codes_must_stand_alone() {
        let e = classify_provider_error("stream reset after 14290 tokens (request 4013)");
        assert!(matches!(e, ServiceError::Transport(_)), "got {e:?}");
        assert!(e.is_retryable());
        assert!(matches!(
            classify_provider_error("status 403: forbidden"),
            ServiceError::Rejected(_)
        ));
    }

    fn env_of(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn configured_model_is_used_with_openai_key() {
        let config = PipelineConfig::builder().model("gpt-4o").build().unwrap();
        let choice = select_provider(&config, env_of(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(choice, Some(("openai".to_string(), "gpt-4o".to_string())));
    }

    #[test]
    fn configured_model_overrides_environment_model() {
        let config = PipelineConfig::builder().model("gemini-2.5-pro").build().unwrap();
        let env = env_of(&[("EDGEQUAKE_LLM_PROVIDER", "gemini"), ("EDGEQUAKE_MODEL", "gemini-2.0-flash")]);
        let choice = select_provider(&config, env).unwrap();
        assert_eq!(choice, Some(("gemini".to_string(), "gemini-2.5-pro".to_string())));
    }

    #[test]
    fn named_provider_defaults_model() {
        let config = PipelineConfig::builder().provider_name("anthropic").build().unwrap();
        let choice = select_provider(&config, env_of(&[])).unwrap();
        assert_eq!(choice, Some(("anthropic".to_string(), DEFAULT_MODEL.to_string())));
    }

    #[test]
    fn model_without_provider_is_rejected() {
        let config = PipelineConfig::builder().model("gpt-4o").build().unwrap();
        let err = select_provider(&config, env_of(&[("ANTHROPIC_API_KEY", "x")])).unwrap_err();
        assert!(matches!(err, PdfScanError::InvalidConfig(_)));
        assert!(err.to_string().contains("gpt-4o"));
    }

    #[test]
    fn environment_provider_accepts_configured_model_alone() {
        let config = PipelineConfig::builder().model("claude-sonnet-4-20250514").build().unwrap();
        let choice =
            select_provider(&config, env_of(&[("EDGEQUAKE_LLM_PROVIDER", "anthropic")])).unwrap();
        assert_eq!(
            choice,
            Some(("anthropic".to_string(), "claude-sonnet-4-20250514".to_string()))
        );
    }

    #[test]
    fn nothing_configured_falls_back_to_auto_detection() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(select_provider(&config, env_of(&[("OPENAI_API_KEY", "")])).unwrap(), None);
    }

    #[test]
    fn build_options_follows_config() {
        let config = PipelineConfig::builder()
            .temperature(0.3)
            .max_tokens(2048)
            .build()
            .unwrap();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(2048));
    }
}
