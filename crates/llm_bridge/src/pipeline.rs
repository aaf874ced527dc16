//! Pipeline coordinator
//!
//! The single entry point used by callers: normalize the photo, submit it
//! through the orchestrator, validate the reply. Recovery happens only
//! inside the orchestrator; any other error is returned as-is.

use crate::backend::{FailureClass, InferenceBackend};
use crate::config::PipelineConfig;
use crate::orchestrator::{AttemptHistory, Orchestrator, SubmissionError};
use core_pipeline::{
    normalize, validate, DesignRequest, DesignResult, NormalizeError, NormalizedImage, RawImage,
    ValidationError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything that can end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The caller's photo could not be read
    #[error(transparent)]
    ImageDecode(NormalizeError),

    /// Normalization failed for a reason unrelated to the photo's content
    #[error("image processing failed: {0}")]
    ImageProcessing(#[source] NormalizeError),

    #[error("all inference targets exhausted after {0}")]
    SubmissionExhausted(AttemptHistory),

    #[error("response is not valid JSON: {0}")]
    MalformedResponse(String),

    #[error("response field `{field}` {problem}")]
    SchemaViolation { field: String, problem: String },

    #[error("design request cancelled")]
    Cancelled,
}

impl From<NormalizeError> for PipelineError {
    fn from(error: NormalizeError) -> Self {
        match error {
            NormalizeError::ImageDecode(_)
            | NormalizeError::EmptyInput
            | NormalizeError::UnsupportedFormat(_) => Self::ImageDecode(error),
            NormalizeError::Read { .. }
            | NormalizeError::Encode(_)
            | NormalizeError::InvalidOptions(_) => Self::ImageProcessing(error),
        }
    }
}

impl From<SubmissionError> for PipelineError {
    fn from(error: SubmissionError) -> Self {
        match error {
            SubmissionError::Exhausted(history) => Self::SubmissionExhausted(history),
            SubmissionError::Cancelled(_) => Self::Cancelled,
        }
    }
}

impl From<ValidationError> for PipelineError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::MalformedResponse(reason) => Self::MalformedResponse(reason),
            ValidationError::SchemaViolation { field, problem } => {
                Self::SchemaViolation { field, problem }
            }
        }
    }
}

impl PipelineError {
    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ImageDecode(_) => "image_decode",
            Self::ImageProcessing(_) => "internal",
            Self::SubmissionExhausted(history) => match history.dominant_failure() {
                Some(FailureClass::RateLimited) => "overloaded",
                Some(FailureClass::Fatal) => "invalid_request",
                Some(FailureClass::Transient) => "unavailable",
                None => "no_targets",
            },
            Self::MalformedResponse(_) => "malformed_response",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::Cancelled => "cancelled",
        }
    }

    /// Message suitable for showing to the end user
    pub fn user_message(&self) -> String {
        match self {
            Self::ImageDecode(error) => format!(
                "The photo could not be read. Please upload a PNG, JPEG or WEBP image ({}).",
                error
            ),
            Self::ImageProcessing(_) => {
                "The photo could not be prepared for submission because of a server problem. Please try again later."
                    .to_string()
            }
            Self::SubmissionExhausted(history) => match history.dominant_failure() {
                Some(FailureClass::RateLimited) => {
                    "The design service is overloaded right now. Please try again in a few minutes."
                        .to_string()
                }
                Some(FailureClass::Fatal) => format!(
                    "The design request was rejected as invalid: {}",
                    history.last_error().unwrap_or("no details")
                ),
                Some(FailureClass::Transient) => {
                    "The design service could not be reached. Please check your connection and try again."
                        .to_string()
                }
                None => "No design models are configured.".to_string(),
            },
            Self::MalformedResponse(_) | Self::SchemaViolation { .. } => format!(
                "The design service returned an unexpected answer ({}). Please try again.",
                self
            ),
            Self::Cancelled => "The design request was cancelled.".to_string(),
        }
    }
}

/// A completed run: the result plus what it took to get it
#[derive(Debug, Clone)]
pub struct DesignRun {
    pub result: DesignResult,
    /// Target that produced the result
    pub target: String,
    pub attempts: AttemptHistory,
    /// Payload that was submitted
    pub image: NormalizedImage,
}

/// Wires normalizer, orchestrator and validator together
///
/// Holds no per-request state; share it behind an `Arc` to serve
/// concurrent callers.
pub struct DesignPipeline {
    backend: Arc<dyn InferenceBackend>,
    config: PipelineConfig,
}

impl DesignPipeline {
    /// Build a pipeline, rejecting an inconsistent configuration up front
    pub fn new(backend: Arc<dyn InferenceBackend>, config: PipelineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Produce a design for `image` and the three free-text parameters
    pub async fn run(
        &self,
        image: &RawImage,
        area: &str,
        furniture: &str,
        mood: &str,
    ) -> Result<DesignResult, PipelineError> {
        self.run_until_cancelled(image, area, furniture, mood, &CancellationToken::new())
            .await
            .map(|run| run.result)
    }

    /// Like `run`, but stops promptly once `cancel` fires and reports the
    /// target and attempt trail alongside the result
    pub async fn run_until_cancelled(
        &self,
        image: &RawImage,
        area: &str,
        furniture: &str,
        mood: &str,
        cancel: &CancellationToken,
    ) -> Result<DesignRun, PipelineError> {
        let normalized = self.normalize_image(image).await?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let request = DesignRequest::new(area, furniture, mood, normalized);
        info!(
            submission = %request.id(),
            width = request.image().width,
            height = request.image().height,
            bytes = request.image().byte_size(),
            "image normalized"
        );

        let submission = Orchestrator::new(self.backend.as_ref(), &self.config.retry)
            .with_response_language(self.config.response_language.as_deref())
            .submit(&request, &self.config.targets, cancel)
            .await?;

        let result = validate(&submission.payload)?;
        info!(
            submission = %request.id(),
            target = %submission.target,
            colors = result.colors.len(),
            items = result.items.len(),
            "design result validated"
        );

        Ok(DesignRun {
            result,
            target: submission.target,
            attempts: submission.attempts,
            image: request.image().clone(),
        })
    }

    /// Image encoding is CPU bound; keep it off the async worker threads.
    async fn normalize_image(&self, image: &RawImage) -> Result<NormalizedImage, PipelineError> {
        let image = image.clone();
        let options = self.config.normalize.clone();
        match tokio::task::spawn_blocking(move || normalize(&image, &options)).await {
            Ok(result) => Ok(result?),
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(_) => Err(PipelineError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ScriptedBackend};
    use crate::config::{InferenceTarget, RetryPolicy, TargetTier};
    use crate::orchestrator::AttemptOutcome;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::io::Cursor;

    const VALID: &str = r##"{"analysis":"Bright","colors":[{"hex":"#EEDDCC","name":"Sand","desc":"warm"}],"layout":"Bed by the window","items":[{"name":"Bed","style":"Low","reason":"space"}]}"##;

    fn raw_image() -> RawImage {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(64, 48, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, 90u8])
        }));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        RawImage::from_bytes(bytes).unwrap()
    }

    fn config(targets: &[&str]) -> PipelineConfig {
        PipelineConfig {
            targets: targets
                .iter()
                .map(|name| InferenceTarget::new(*name, TargetTier::Standard, 1024 * 1024))
                .collect(),
            retry: RetryPolicy {
                max_attempts_per_target: 2,
                pacing_delay_ms: 1,
                base_backoff_ms: 1,
                max_backoff_ms: 4,
                attempt_timeout_ms: 5_000,
            },
            ..Default::default()
        }
    }

    fn pipeline(backend: ScriptedBackend, targets: &[&str]) -> DesignPipeline {
        DesignPipeline::new(Arc::new(backend), config(targets)).unwrap()
    }

    #[tokio::test]
    async fn test_run_returns_validated_result() {
        let backend = ScriptedBackend::new().always("a", Ok(VALID.to_string()));
        let result = pipeline(backend, &["a"])
            .run(&raw_image(), "3m x 3m", "bed", "calm")
            .await
            .unwrap();

        assert_eq!(result.analysis, "Bright");
        assert_eq!(result.colors[0].name, "Sand");
        assert_eq!(result.items[0].rationale, "space");
    }

    #[tokio::test]
    async fn test_undecodable_image_stops_before_submission() {
        let backend = Arc::new(ScriptedBackend::new().always("a", Ok(VALID.to_string())));
        let pipeline = DesignPipeline::new(backend.clone(), config(&["a"])).unwrap();

        let mut bytes = raw_image().bytes().to_vec();
        bytes.truncate(bytes.len() / 2);
        let raw = RawImage::from_bytes(bytes).unwrap();

        let err = pipeline.run(&raw, "", "", "").await.unwrap_err();
        assert!(matches!(err, PipelineError::ImageDecode(_)));
        assert_eq!(err.kind(), "image_decode");
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_invalid_configuration_is_rejected_at_construction() {
        let mut bad = config(&["a"]);
        bad.normalize.max_edge = 0;
        let err = DesignPipeline::new(Arc::new(ScriptedBackend::new()), bad)
            .err()
            .expect("max_edge of zero must be rejected");
        assert!(format!("{:#}", err).contains("max_edge"));
    }

    #[test]
    fn test_only_unreadable_photos_are_image_decode_errors() {
        let err = PipelineError::from(NormalizeError::InvalidOptions(
            "max_edge must be greater than zero".to_string(),
        ));
        assert_ne!(err.kind(), "image_decode");
        assert_eq!(err.kind(), "internal");
        assert!(!err.user_message().contains("upload"));

        let err = PipelineError::from(NormalizeError::Encode(image::ImageError::Limits(
            image::error::LimitError::from_kind(image::error::LimitErrorKind::DimensionError),
        )));
        assert_eq!(err.kind(), "internal");

        for error in [
            NormalizeError::EmptyInput,
            NormalizeError::UnsupportedFormat("gif".to_string()),
        ] {
            assert_eq!(PipelineError::from(error).kind(), "image_decode");
        }
    }

    #[tokio::test]
    async fn test_schema_violation_propagates() {
        let backend = ScriptedBackend::new()
            .always("a", Ok(r#"{"analysis":"x","colors":[],"items":[]}"#.to_string()));
        let err = pipeline(backend, &["a"])
            .run(&raw_image(), "", "", "")
            .await
            .unwrap_err();

        match err {
            PipelineError::SchemaViolation { ref field, .. } => assert_eq!(field, "layout"),
            other => panic!("expected schema violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_response_propagates() {
        let backend = ScriptedBackend::new().always("a", Ok("Sorry, I cannot help".to_string()));
        let err = pipeline(backend, &["a"])
            .run(&raw_image(), "", "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse(_)));
        assert_eq!(err.kind(), "malformed_response");
    }

    #[tokio::test]
    async fn test_exhaustion_messages_distinguish_overload_from_invalid_request() {
        let overloaded = ScriptedBackend::new()
            .always("a", Err(BackendError::from_status(429, "quota")))
            .always("b", Err(BackendError::from_status(429, "quota")));
        let err = pipeline(overloaded, &["a", "b"])
            .run(&raw_image(), "", "", "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "overloaded");
        assert!(err.user_message().contains("overloaded"));

        let invalid = ScriptedBackend::new()
            .always("a", Err(BackendError::from_status(400, "bad image")))
            .always("b", Err(BackendError::from_status(404, "no such model")));
        let err = pipeline(invalid, &["a", "b"])
            .run(&raw_image(), "", "", "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(err.user_message().contains("rejected as invalid"));
        assert!(err.user_message().contains("no such model"));
    }

    #[tokio::test]
    async fn test_run_until_cancelled_reports_trail() {
        let backend = ScriptedBackend::new()
            .script("a", [Err(BackendError::transient("reset"))])
            .always("a", Ok(VALID.to_string()));
        let run = pipeline(backend, &["a"])
            .run_until_cancelled(&raw_image(), "", "", "", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.target, "a");
        assert_eq!(
            run.attempts.outcomes(),
            vec![AttemptOutcome::TransientError, AttemptOutcome::Success]
        );
        assert_eq!((run.image.width, run.image.height), (64, 48));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let backend = Arc::new(ScriptedBackend::new().always("a", Ok(VALID.to_string())));
        let pipeline = DesignPipeline::new(backend.clone(), config(&["a"])).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .run_until_cancelled(&raw_image(), "", "", "", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(backend.calls().is_empty());
    }
}
