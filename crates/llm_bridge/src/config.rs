//! Pipeline configuration
//!
//! Everything endpoint-specific (model names, payload ceilings) and every
//! pacing constant lives here, so operators can follow model churn and
//! tune the retry schedule without touching pipeline code.

use anyhow::{ensure, Context, Result};
use core_pipeline::NormalizeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Relative cost / quality tier of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetTier {
    /// Fast and cheap, tried first
    Economy,
    Standard,
    /// Higher quality, higher cost
    Premium,
}

/// One candidate model on the inference endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceTarget {
    /// Model identifier as the endpoint knows it
    pub name: String,
    pub tier: TargetTier,
    /// Largest image payload this target accepts, in bytes
    pub max_payload_bytes: usize,
}

impl InferenceTarget {
    pub fn new(name: impl Into<String>, tier: TargetTier, max_payload_bytes: usize) -> Self {
        Self {
            name: name.into(),
            tier,
            max_payload_bytes,
        }
    }
}

/// Pacing and retry schedule
///
/// A delay is slept before every attempt, the first one included: the
/// pacing delay normally, or `base_backoff * 2^(n-1)` (capped at
/// `max_backoff`) after `n` consecutive rate-limits on the same target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per target before falling through to the next one
    pub max_attempts_per_target: u32,
    pub pacing_delay_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on a single network attempt
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_target: 3,
            pacing_delay_ms: 1_000,
            base_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            attempt_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delay to sleep before the next attempt on a target that has just
    /// seen `consecutive_rate_limits` rate-limit replies in a row
    pub fn delay_before_attempt(&self, consecutive_rate_limits: u32) -> Duration {
        if consecutive_rate_limits == 0 {
            return self.pacing_delay();
        }
        let factor = 1u64
            .checked_shl(consecutive_rate_limits - 1)
            .unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_attempts_per_target >= 1,
            "retry.max_attempts_per_target must be at least 1"
        );
        ensure!(
            self.max_backoff_ms >= self.base_backoff_ms,
            "retry.max_backoff_ms ({}) is below retry.base_backoff_ms ({})",
            self.max_backoff_ms,
            self.base_backoff_ms
        );
        ensure!(
            self.attempt_timeout_ms > 0,
            "retry.attempt_timeout_ms must be greater than zero"
        );
        Ok(())
    }
}

/// Complete configuration for one `DesignPipeline`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Targets in priority order
    pub targets: Vec<InferenceTarget>,
    pub retry: RetryPolicy,
    pub normalize: NormalizeOptions,
    /// Language the endpoint should answer in; endpoint default when unset
    pub response_language: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            targets: vec![
                InferenceTarget::new("gemini-2.5-flash-lite", TargetTier::Economy, 4 * 1024 * 1024),
                InferenceTarget::new("gemini-2.5-flash", TargetTier::Standard, 4 * 1024 * 1024),
            ],
            retry: RetryPolicy::default(),
            normalize: NormalizeOptions::default(),
            response_language: None,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file
    ///
    /// Missing fields take their default values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.targets.is_empty(), "at least one inference target is required");
        for target in &self.targets {
            ensure!(!target.name.trim().is_empty(), "inference target names must not be empty");
            ensure!(
                target.max_payload_bytes > 0,
                "target {} has a zero payload ceiling",
                target.name
            );
        }
        self.retry.validate()?;
        self.normalize
            .validate()
            .context("invalid normalize section")?;
        Ok(())
    }
}
