//! Inference backend abstraction
//!
//! The orchestrator talks to the remote endpoint only through
//! `InferenceBackend`, so the concrete transport (Gemini over HTTP, a
//! scripted dry-run backend) can be swapped without touching retry logic.

use crate::config::InferenceTarget;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// How a failed call should be treated by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Explicit quota-exceeded signal; back off and retry the same target
    RateLimited,
    /// Network failure, timeout or server-side hiccup; retry the same target
    Transient,
    /// Bad request, auth, unknown model; move on to the next target
    Fatal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RateLimited => "rate-limited",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        })
    }
}

/// Map an HTTP status code onto a failure class
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        429 => FailureClass::RateLimited,
        408 | 500..=599 => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// A classified failure from one backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct BackendError {
    pub class: FailureClass,
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureClass::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Fatal, message)
    }

    /// Build an error from a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            class: classify_status(status),
            status: Some(status),
            message: message.into(),
        }
    }
}

/// One part of a multimodal request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

/// Transport-neutral "generate content" request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub parts: Vec<Part>,
    /// Response-format hint, e.g. `application/json`
    pub response_mime_type: Option<String>,
}

/// A remote endpoint able to answer multimodal prompts
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Send one request to `target` and return the response text
    async fn generate_content(
        &self,
        target: &InferenceTarget,
        request: &GenerateRequest,
    ) -> Result<String, BackendError>;
}

type Reply = Result<String, BackendError>;

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    then: Option<Reply>,
}

/// Backend that replays canned replies per target name
///
/// Used for dry runs and for exercising the orchestrator without a
/// network. Targets with no script left answer with a fatal error.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `target`, consumed in order
    pub fn script(self, target: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.lock_scripts()
            .entry(target.to_string())
            .or_default()
            .replies
            .extend(replies);
        self
    }

    /// Reply with `reply` once the queued replies for `target` run out
    pub fn always(self, target: &str, reply: Reply) -> Self {
        self.lock_scripts().entry(target.to_string()).or_default().then = Some(reply);
        self
    }

    /// Target names in the order they were called
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_to(&self, target: &str) -> usize {
        self.calls().iter().filter(|name| *name == target).count()
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Script>> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn generate_content(
        &self,
        target: &InferenceTarget,
        _request: &GenerateRequest,
    ) -> Result<String, BackendError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.name.clone());

        let mut scripts = self.lock_scripts();
        let script = scripts.get_mut(&target.name);
        script
            .and_then(|script| script.replies.pop_front().or_else(|| script.then.clone()))
            .unwrap_or_else(|| {
                Err(BackendError::from_status(
                    404,
                    format!("model {} is not available", target.name),
                ))
            })
    }
}
