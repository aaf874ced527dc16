//! Request orchestration across inference targets
//!
//! Targets are tried in priority order. Each target gets a bounded number
//! of attempts; a pacing delay precedes every attempt and grows
//! exponentially while the target keeps answering with rate-limit
//! signals. Fatal failures skip straight to the next target.
//!
//! ```text
//! Idle -> Attempting(target, n) -> Success
//!                               -> RateLimited    -> Attempting(target, n+1) | next target
//!                               -> TransientError -> Attempting(target, n+1) | next target
//!                               -> FatalError     -> next target
//! no targets left               -> Exhausted
//! ```

use crate::backend::{BackendError, FailureClass, GenerateRequest, InferenceBackend, Part};
use crate::config::{InferenceTarget, RetryPolicy};
use crate::prompt::build_prompt;
use chrono::{DateTime, Utc};
use core_pipeline::DesignRequest;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    TransientError,
    FatalError,
}

impl From<FailureClass> for AttemptOutcome {
    fn from(class: FailureClass) -> Self {
        match class {
            FailureClass::RateLimited => Self::RateLimited,
            FailureClass::Transient => Self::TransientError,
            FailureClass::Fatal => Self::FatalError,
        }
    }
}

/// One submission attempt, kept for backoff decisions and diagnostics
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub target: String,
    /// 1-based attempt number on this target
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    /// Delay slept before the attempt was sent
    pub delay: Duration,
    pub latency: Duration,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

/// Ordered attempt records of one orchestrated call
#[derive(Debug, Clone, Default)]
pub struct AttemptHistory {
    records: Vec<AttemptRecord>,
}

impl AttemptHistory {
    fn push(&mut self, record: AttemptRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn outcomes(&self) -> Vec<AttemptOutcome> {
        self.records.iter().map(|r| r.outcome).collect()
    }

    pub fn count(&self, outcome: AttemptOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Sum of the delays slept before each attempt
    pub fn total_delay(&self) -> Duration {
        self.records.iter().map(|r| r.delay).sum()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.records.iter().rev().find_map(|r| r.error.as_deref())
    }

    /// Failure class seen most often; ties favour rate-limited, then fatal
    pub fn dominant_failure(&self) -> Option<FailureClass> {
        [
            (FailureClass::RateLimited, AttemptOutcome::RateLimited),
            (FailureClass::Fatal, AttemptOutcome::FatalError),
            (FailureClass::Transient, AttemptOutcome::TransientError),
        ]
        .into_iter()
        .map(|(class, outcome)| (class, self.count(outcome)))
        .filter(|(_, count)| *count > 0)
        .fold(None, |best: Option<(FailureClass, usize)>, (class, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((class, count)),
        })
        .map(|(class, _)| class)
    }
}

impl std::fmt::Display for AttemptHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} attempt(s)", self.len())?;
        if let Some(error) = self.last_error() {
            write!(f, ", last error: {}", error)?;
        }
        Ok(())
    }
}

/// Orchestration failures
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("all inference targets exhausted after {0}")]
    Exhausted(AttemptHistory),

    #[error("submission cancelled after {0}")]
    Cancelled(AttemptHistory),
}

/// A successful orchestrated call
#[derive(Debug, Clone)]
pub struct Submission {
    /// Raw response text from the endpoint
    pub payload: String,
    /// Target that produced the payload
    pub target: String,
    pub attempts: AttemptHistory,
}

/// Drives one design request through the target list
pub struct Orchestrator<'a> {
    backend: &'a dyn InferenceBackend,
    policy: &'a RetryPolicy,
    response_language: Option<&'a str>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(backend: &'a dyn InferenceBackend, policy: &'a RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            response_language: None,
        }
    }

    pub fn with_response_language(mut self, language: Option<&'a str>) -> Self {
        self.response_language = language;
        self
    }

    /// Submit `request`, falling back through `targets` in order
    ///
    /// # Errors
    /// * `SubmissionError::Exhausted` once every target has used up its
    ///   attempts or failed fatally
    /// * `SubmissionError::Cancelled` as soon as `cancel` fires
    pub async fn submit(
        &self,
        request: &DesignRequest,
        targets: &[InferenceTarget],
        cancel: &CancellationToken,
    ) -> Result<Submission, SubmissionError> {
        let generate = GenerateRequest {
            parts: vec![
                Part::InlineData {
                    mime_type: request.image().mime_type().to_string(),
                    data: request.image().bytes.clone(),
                },
                Part::Text(build_prompt(request, self.response_language)),
            ],
            response_mime_type: Some("application/json".to_string()),
        };
        let payload_size = request.image().byte_size();
        let mut history = AttemptHistory::default();

        for target in targets {
            if payload_size > target.max_payload_bytes {
                let message = format!(
                    "image payload of {} bytes exceeds the {} byte ceiling of {}",
                    payload_size, target.max_payload_bytes, target.name
                );
                warn!(submission = %request.id(), target = %target.name, "{}", message);
                history.push(AttemptRecord {
                    target: target.name.clone(),
                    attempt: 1,
                    started_at: Utc::now(),
                    delay: Duration::ZERO,
                    latency: Duration::ZERO,
                    outcome: AttemptOutcome::FatalError,
                    error: Some(message),
                });
                continue;
            }

            let mut consecutive_rate_limits = 0;
            for attempt in 1..=self.policy.max_attempts_per_target {
                let delay = self.policy.delay_before_attempt(consecutive_rate_limits);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SubmissionError::Cancelled(history)),
                    _ = tokio::time::sleep(delay) => {}
                }

                info!(
                    submission = %request.id(),
                    target = %target.name,
                    attempt,
                    "submitting design request"
                );
                let started_at = Utc::now();
                let clock = Instant::now();
                let reply = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SubmissionError::Cancelled(history)),
                    reply = tokio::time::timeout(
                        self.policy.attempt_timeout(),
                        self.backend.generate_content(target, &generate),
                    ) => reply,
                };
                let latency = clock.elapsed();

                let error = match reply {
                    Ok(Ok(payload)) => {
                        info!(
                            submission = %request.id(),
                            target = %target.name,
                            attempt,
                            latency_ms = latency.as_millis() as u64,
                            "design request succeeded"
                        );
                        history.push(AttemptRecord {
                            target: target.name.clone(),
                            attempt,
                            started_at,
                            delay,
                            latency,
                            outcome: AttemptOutcome::Success,
                            error: None,
                        });
                        return Ok(Submission {
                            payload,
                            target: target.name.clone(),
                            attempts: history,
                        });
                    }
                    Ok(Err(error)) => error,
                    Err(_) => BackendError::transient(format!(
                        "attempt timed out after {:?}",
                        self.policy.attempt_timeout()
                    )),
                };

                warn!(
                    submission = %request.id(),
                    target = %target.name,
                    attempt,
                    class = %error.class,
                    "{}",
                    error
                );
                history.push(AttemptRecord {
                    target: target.name.clone(),
                    attempt,
                    started_at,
                    delay,
                    latency,
                    outcome: error.class.into(),
                    error: Some(error.to_string()),
                });

                match error.class {
                    FailureClass::RateLimited => consecutive_rate_limits += 1,
                    FailureClass::Transient => consecutive_rate_limits = 0,
                    FailureClass::Fatal => break,
                }
            }
        }

        Err(SubmissionError::Exhausted(history))
    }
}
