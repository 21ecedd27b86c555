//! Page extraction: call the service, validate the reply, retry on failure.
//!
//! ## Two retry budgets
//!
//! * **Transport** (timeouts, throttling, 5xx): up to `max_retries` attempts
//!   with exponential backoff `base × 2^(n-1)`. A throttle reply that names a
//!   delay waits at least that long.
//! * **Validation** (reply does not match the schema): the input did not
//!   change, but generation is non-deterministic, so the same request is sent
//!   again at most `max_validation_retries` times, without backoff.
//!
//! A rejected request (bad credentials, invalid request) is never retried.
//! When a budget runs out the page ends with [`PageError::ExtractionFailed`];
//! the caller records it as an empty page and moves on.

use crate::config::PipelineConfig;
use crate::error::{PageError, ServiceError, ValidationError};
use crate::model::{BoundingBox, Component, ComponentType, PageResult};
use crate::orchestrator::CancelToken;
use crate::prompts;
use crate::service::{EncodedImage, InferenceService};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Extract one page, retrying per the configured budgets.
pub async fn extract_page(
    service: &dyn InferenceService,
    image: &EncodedImage,
    page_number: usize,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<PageResult, PageError> {
    let instruction = prompts::instruction(config.instruction.as_deref());
    let mut attempts = 0u32;
    let mut transport_failures = 0u32;
    let mut validation_failures = 0u32;

    let failed = |attempts: u32, detail: String| PageError::ExtractionFailed {
        page: page_number,
        attempts,
        detail,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(PageError::Cancelled { page: page_number });
        }
        attempts += 1;

        let outcome = match timeout(config.api_timeout(), service.invoke(image, instruction)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ServiceError::Timeout {
                secs: config.api_timeout_secs,
            }),
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) if !e.is_retryable() => {
                warn!("Page {}: {} rejected the request: {}", page_number, service.name(), e);
                return Err(failed(attempts, e.to_string()));
            }
            Err(e) => {
                transport_failures += 1;
                if transport_failures >= config.max_retries {
                    warn!(
                        "Page {}: giving up after {} transport failures: {}",
                        page_number, transport_failures, e
                    );
                    return Err(failed(attempts, e.to_string()));
                }
                let delay = retry_delay(config, transport_failures, &e);
                warn!(
                    "Page {}: attempt {} failed ({}), retry {}/{} after {}ms",
                    page_number,
                    attempts,
                    e,
                    transport_failures,
                    config.max_retries - 1,
                    delay.as_millis()
                );
                sleep(delay).await;
                continue;
            }
        };

        match parse_components(&reply) {
            Ok(components) => {
                debug!(
                    "Page {}: {} components after {} attempt(s)",
                    page_number,
                    components.len(),
                    attempts
                );
                return Ok(PageResult::new(page_number, components));
            }
            Err(e) => {
                validation_failures += 1;
                if validation_failures > config.max_validation_retries {
                    warn!(
                        "Page {}: reply still invalid after {} regeneration(s): {}",
                        page_number, config.max_validation_retries, e
                    );
                    return Err(failed(attempts, e.to_string()));
                }
                warn!(
                    "Page {}: invalid reply ({}), regenerating ({}/{})",
                    page_number, e, validation_failures, config.max_validation_retries
                );
                debug!("Page {}: rejected reply: {:.500}", page_number, reply);
            }
        }
    }
}

/// Backoff for the next attempt; throttle hints extend it, never shorten it.
fn retry_delay(config: &PipelineConfig, failures: u32, error: &ServiceError) -> Duration {
    let backoff = config.backoff_delay(failures);
    match error {
        ServiceError::Throttle {
            retry_after_secs: Some(secs),
        } => backoff.max(Duration::from_secs(*secs)),
        _ => backoff,
    }
}

// ── Reply decoding ───────────────────────────────────────────────────────────

/// Component as the model sends it, before validation.
#[derive(Debug, Deserialize)]
struct RawComponent {
    component_id: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
    confidence: f64,
    bbox: [f64; 4],
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*?)\n?```\s*$").expect("valid regex"));

/// Zero-width characters and BOMs models sometimes emit inside content.
static RE_INVISIBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{200B}\u{200C}\u{200D}\u{2060}\u{FEFF}\u{00AD}]").expect("valid regex"));

/// Decode and validate a raw reply into page components.
///
/// Accepts `{"components": [...]}` or a bare array, optionally wrapped in a
/// code fence or surrounded by prose.
pub fn parse_components(reply: &str) -> Result<Vec<Component>, ValidationError> {
    let list = locate_component_list(strip_fences(reply))?;
    let raw: Vec<RawComponent> =
        serde_json::from_value(list).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate_components(raw)
}

fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map_or(trimmed, |m| m.as_str()),
        None => trimmed,
    }
}

/// Byte offset of `open` and the slice up to the last `close`.
fn span(body: &str, open: char, close: char) -> Option<(usize, &str)> {
    let start = body.find(open)?;
    let end = body.rfind(close)?;
    (end > start).then(|| (start, &body[start..=end]))
}

/// Find the component list in `body`.
///
/// The outermost `{...}` carrying a `components` key wins. A bare `[...]`
/// is only considered when it opens before any object, so brackets in the
/// prose or inside a wrapper object never shadow the real payload.
fn locate_component_list(body: &str) -> Result<serde_json::Value, ValidationError> {
    let object = span(body, '{', '}');
    let array = span(body, '[', ']');
    let mut first_error = None;

    if let Some((_, json)) = object {
        match serde_json::from_str::<serde_json::Value>(json) {
            Ok(serde_json::Value::Object(mut map)) => match map.remove("components") {
                Some(list) => return Ok(list),
                None => {
                    first_error = Some(ValidationError::Malformed("missing field `components`".into()))
                }
            },
            Ok(_) => {}
            Err(e) => first_error = Some(ValidationError::Malformed(e.to_string())),
        }
    }

    if let Some((array_start, json)) = array {
        let opens_first = object.map_or(true, |(object_start, _)| array_start < object_start);
        if opens_first {
            match serde_json::from_str::<serde_json::Value>(json) {
                Ok(list @ serde_json::Value::Array(_)) => return Ok(list),
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(ValidationError::Malformed(e.to_string()));
                }
            }
        }
    }

    Err(first_error.unwrap_or(ValidationError::NoJson))
}

fn validate_components(raw: Vec<RawComponent>) -> Result<Vec<Component>, ValidationError> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut components = Vec::with_capacity(raw.len());

    for (position, item) in raw.into_iter().enumerate() {
        let id = item.component_id.trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::EmptyComponentId(position));
        }
        if !seen.insert(id.clone()) {
            return Err(ValidationError::DuplicateComponentId(id));
        }

        let kind: ComponentType = item.kind.parse().map_err(|kind| ValidationError::UnknownType {
            id: id.clone(),
            kind,
        })?;

        if !item.confidence.is_finite() || !(0.0..=1.0).contains(&item.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange {
                id,
                value: item.confidence,
            });
        }

        let bbox = BoundingBox(item.bbox);
        if !bbox.is_valid() {
            return Err(ValidationError::InvalidBoundingBox { id, bbox: item.bbox });
        }

        components.push(Component {
            component_id: id,
            kind,
            content: RE_INVISIBLE.replace_all(&item.content, "").into_owned(),
            confidence: item.confidence,
            bbox,
        });
    }

    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const VALID: &str = r#"{"components": [
        {"component_id": "1_0", "type": "header", "content": "ACME Tender", "confidence": 0.95, "bbox": [50, 20, 900, 80]},
        {"component_id": "1_1", "type": "text", "content": "Scope of work", "confidence": 0.9, "bbox": [50, 100, 900, 300]}
    ]}"#;

    /// Replays a fixed script of outcomes, one per call.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, ServiceError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, ServiceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceService for Scripted {
        async fn invoke(&self, _image: &EncodedImage, _instruction: &str) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                sleep(d).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::Transport("script exhausted".into())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn image() -> EncodedImage {
        EncodedImage {
            data: "iVBORw0KGgo=".into(),
            mime_type: "image/png".into(),
            width: 1000,
            height: 1400,
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .retry_base_delay_ms(10)
            .api_timeout_secs(1)
            .build()
            .unwrap()
    }

    #[test]
    fn parses_wrapped_object() {
        let components = parse_components(VALID).unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].kind, ComponentType::Header);
        assert_eq!(components[1].bbox, BoundingBox::new(50.0, 100.0, 900.0, 300.0));
    }

    #[test]
    fn parses_fenced_reply_with_prose() {
        let reply = format!("```json\n{VALID}\n```");
        assert_eq!(parse_components(&reply).unwrap().len(), 2);

        let chatty = format!("Here is the extraction:\n{VALID}\nLet me know if you need more.");
        assert_eq!(parse_components(&chatty).unwrap().len(), 2);
    }

    #[test]
    fn parses_bare_array_and_empty_page() {
        let bare = r#"[{"component_id": "a", "type": "footer", "content": "p. 1", "confidence": 1, "bbox": [0, 1300, 1000, 1400]}]"#;
        assert_eq!(parse_components(bare).unwrap()[0].kind, ComponentType::Footer);
        assert!(parse_components(r#"{"components": []}"#).unwrap().is_empty());
    }

    #[test]
    fn brackets_in_leading_prose_do_not_hide_the_object() {
        let reply = format!("Extracted [2] components from the page:\n{VALID}");
        assert_eq!(parse_components(&reply).unwrap().len(), 2);

        let noted = format!("{VALID}\n[note: footer is partially cut off]");
        assert_eq!(parse_components(&noted).unwrap().len(), 2);
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let reply = VALID.replace("0.95", "1.5");
        assert!(matches!(
            parse_components(&reply),
            Err(ValidationError::ConfidenceOutOfRange { value, .. }) if value == 1.5
        ));
    }

    #[test]
    fn rejects_schema_violations() {
        assert_eq!(parse_components("no json here"), Err(ValidationError::NoJson));
        assert!(matches!(
            parse_components(&VALID.replace("\"header\"", "\"figure\"")),
            Err(ValidationError::UnknownType { .. })
        ));
        assert!(matches!(
            parse_components(&VALID.replace("[50, 20, 900, 80]", "[900, 20, 50, 80]")),
            Err(ValidationError::InvalidBoundingBox { .. })
        ));
        assert!(matches!(
            parse_components(&VALID.replace("\"1_1\"", "\"1_0\"")),
            Err(ValidationError::DuplicateComponentId(_))
        ));
        assert!(matches!(
            parse_components(&VALID.replace("\"confidence\": 0.9,", "")),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            parse_components(&VALID.replace("0.95", "\"high\"")),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            parse_components(r#"{"items": []}"#),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn strips_invisible_characters_from_content() {
        let reply = VALID.replace("Scope of work", "Scope\u{200B} of\u{FEFF} work");
        assert_eq!(parse_components(&reply).unwrap()[1].content, "Scope of work");
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let service = Scripted::new(vec![
            Err(ServiceError::Throttle {
                retry_after_secs: None,
            }),
            Err(ServiceError::Transport("502".into())),
            Ok(VALID.to_string()),
        ]);
        let page = extract_page(&service, &image(), 1, &config(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(page.component_count, 2);
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn transport_budget_exhaustion_fails_the_page() {
        let service = Scripted::new(vec![
            Err(ServiceError::Transport("503".into())),
            Err(ServiceError::Transport("503".into())),
            Err(ServiceError::Transport("503".into())),
            Ok(VALID.to_string()),
        ]);
        let err = extract_page(&service, &image(), 4, &config(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::ExtractionFailed { page: 4, attempts: 3, .. }));
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_transport_failures() {
        let mut service = Scripted::new(vec![
            Ok(VALID.to_string()),
            Ok(VALID.to_string()),
            Ok(VALID.to_string()),
        ]);
        service.delay = Some(Duration::from_secs(30));

        let err = extract_page(&service, &image(), 2, &config(), &CancelToken::new())
            .await
            .unwrap_err();
        match err {
            PageError::ExtractionFailed { attempts, detail, .. } => {
                assert_eq!(attempts, 3);
                assert!(detail.contains("timed out"), "got: {detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_reply_is_regenerated_once() {
        let bad = VALID.replace("0.95", "1.5");
        let service = Scripted::new(vec![Ok(bad.clone()), Ok(VALID.to_string())]);
        let page = extract_page(&service, &image(), 1, &config(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(page.component_count, 2);
        assert_eq!(service.calls(), 2);

        let service = Scripted::new(vec![Ok(bad.clone()), Ok(bad.clone()), Ok(VALID.to_string())]);
        let err = extract_page(&service, &image(), 1, &config(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::ExtractionFailed { attempts: 2, .. }));
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let service = Scripted::new(vec![
            Err(ServiceError::Rejected("401 invalid api key".into())),
            Ok(VALID.to_string()),
        ]);
        let err = extract_page(&service, &image(), 1, &config(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::ExtractionFailed { attempts: 1, .. }));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_issues_no_calls() {
        let service = Scripted::new(vec![Ok(VALID.to_string())]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = extract_page(&service, &image(), 3, &config(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, PageError::Cancelled { page: 3 });
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn throttle_hint_extends_backoff() {
        let config = config();
        let hinted = ServiceError::Throttle {
            retry_after_secs: Some(5),
        };
        assert_eq!(retry_delay(&config, 1, &hinted), Duration::from_secs(5));
        let plain = ServiceError::Transport("x".into());
        assert_eq!(retry_delay(&config, 2, &plain), Duration::from_millis(20));
    }
}
