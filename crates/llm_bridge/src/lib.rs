//! LLM Bridge for Gemini integration
//!
//! Submits normalized room photos to a multimodal inference endpoint.
//! Provides the backend abstraction and Gemini HTTP client, the
//! orchestrator that paces, retries and falls back between models,
//! and the `DesignPipeline` coordinator that ties the whole flow
//! together.
//!
//! Copyright (c) 2025 Michael A Wright

pub mod backend;
pub mod config;
pub mod gemini;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;

pub use backend::{BackendError, FailureClass, InferenceBackend, ScriptedBackend};
pub use config::{InferenceTarget, PipelineConfig, RetryPolicy, TargetTier};
pub use gemini::{GeminiClient, GeminiConfig};
pub use orchestrator::{AttemptHistory, AttemptOutcome, AttemptRecord, Orchestrator};
pub use pipeline::{DesignPipeline, DesignRun, PipelineError};
pub use tokio_util::sync::CancellationToken;
