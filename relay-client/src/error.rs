//! Error taxonomy for remote calls.
//!
//! Every call-level error carries the request it came from (and, where the
//! substrate answered, the raw answer) so a failure can be diagnosed from the
//! error value alone.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use relay_types::{RequestData, TagMap};
use serde::Serialize;

use crate::substrate::SubstrateError;

/// Diagnostic snapshot of the call that failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallContext {
    pub call_id: String,
    pub process_id: String,
    pub action: Option<String>,
    pub tags: TagMap,
    /// Request payload; binary bodies are base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Attempts allowed per phase.
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub message_id: Option<String>,
    pub raw_response: Option<serde_json::Value>,
}

impl CallContext {
    pub fn new(call_id: impl Into<String>, process_id: impl Into<String>, tags: &TagMap) -> Self {
        Self {
            call_id: call_id.into(),
            process_id: process_id.into(),
            action: tags.action().map(ToString::to_string),
            tags: tags.clone(),
            message_id: None,
            raw_response: None,
            ..Self::default()
        }
    }

    pub fn with_request(mut self, data: Option<&RequestData>, retries: u32) -> Self {
        self.data = data.map(|data| match data {
            RequestData::Text(text) => text.clone(),
            RequestData::Binary(bytes) => BASE64.encode(bytes),
        });
        self.retries = retries;
        self
    }

    pub fn with_spawn_target(mut self, scheduler: Option<&str>, module: Option<&str>) -> Self {
        self.scheduler = scheduler.map(ToString::to_string);
        self.module = module.map(ToString::to_string);
        self
    }

    /// What the call was addressed to, for error messages.
    pub fn target(&self) -> String {
        if !self.process_id.is_empty() {
            return format!("process {}", self.process_id);
        }
        format!(
            "spawn of module {} on scheduler {}",
            self.module.as_deref().unwrap_or("<unset>"),
            self.scheduler.as_deref().unwrap_or("<unset>")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no signer supplied or configured for {}", .context.target())]
    NoSigner { context: Box<CallContext> },

    #[error("invalid request: {reason}")]
    InvalidRequest {
        reason: String,
        context: Box<CallContext>,
    },

    #[error("submit to process {} failed after {attempts} attempt(s): {source}", .context.process_id)]
    SubmitFailed {
        attempts: u32,
        #[source]
        source: SubstrateError,
        context: Box<CallContext>,
    },

    #[error("evaluate on process {} failed after {attempts} attempt(s): {source}", .context.process_id)]
    EvaluateFailed {
        attempts: u32,
        #[source]
        source: SubstrateError,
        context: Box<CallContext>,
    },

    #[error("{} failed after {attempts} attempt(s): {source}", .context.target())]
    SpawnFailed {
        attempts: u32,
        #[source]
        source: SubstrateError,
        context: Box<CallContext>,
    },

    #[error("process {} returned no messages", .context.process_id)]
    NoMessagesReturned { context: Box<CallContext> },

    #[error("read from process {} returned {count} messages, expected exactly one", .context.process_id)]
    AmbiguousReadResult {
        count: usize,
        context: Box<CallContext>,
    },

    #[error("process {} reported an execution error: {error}", .context.process_id)]
    RemoteExecution {
        error: String,
        context: Box<CallContext>,
    },

    #[error("process {} answered with status {code}: {body}", .context.process_id)]
    RemoteStatus {
        code: String,
        body: String,
        context: Box<CallContext>,
    },

    #[error("operation cancelled")]
    Cancelled { context: Option<Box<CallContext>> },

    #[error("cache read of '{path}' failed after {attempts} attempt(s): {source}")]
    CacheReadFailed {
        path: String,
        attempts: u32,
        #[source]
        source: SubstrateError,
    },

    /// `last_values` holds each source's value from the final tick.
    #[error("convergence timed out after {attempts} attempt(s) in {elapsed:?}")]
    ConvergenceTimedOut {
        attempts: u32,
        elapsed: Duration,
        last_values: Vec<Option<serde_json::Value>>,
    },

    #[error("convergence gave up after {attempts} attempt(s) in {elapsed:?}")]
    ConvergenceExhausted {
        attempts: u32,
        elapsed: Duration,
        last_values: Vec<Option<serde_json::Value>>,
    },
}

impl RelayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSigner { .. } => "NO_SIGNER",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::SubmitFailed { .. } => "SUBMIT_FAILED",
            Self::EvaluateFailed { .. } => "EVALUATE_FAILED",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::NoMessagesReturned { .. } => "NO_MESSAGES_RETURNED",
            Self::AmbiguousReadResult { .. } => "AMBIGUOUS_READ_RESULT",
            Self::RemoteExecution { .. } => "REMOTE_EXECUTION_ERROR",
            Self::RemoteStatus { .. } => "REMOTE_STATUS_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::CacheReadFailed { .. } => "CACHE_READ_FAILED",
            Self::ConvergenceTimedOut { .. } => "TIMED_OUT",
            Self::ConvergenceExhausted { .. } => "EXHAUSTED",
        }
    }

    pub fn context(&self) -> Option<&CallContext> {
        match self {
            Self::NoSigner { context }
            | Self::InvalidRequest { context, .. }
            | Self::SubmitFailed { context, .. }
            | Self::EvaluateFailed { context, .. }
            | Self::SpawnFailed { context, .. }
            | Self::NoMessagesReturned { context }
            | Self::AmbiguousReadResult { context, .. }
            | Self::RemoteExecution { context, .. }
            | Self::RemoteStatus { context, .. } => Some(&**context),
            Self::Cancelled { context } => context.as_deref(),
            Self::CacheReadFailed { .. }
            | Self::ConvergenceTimedOut { .. }
            | Self::ConvergenceExhausted { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Per-source values from the last convergence tick.
    pub fn last_values(&self) -> Option<&[Option<serde_json::Value>]> {
        match self {
            Self::ConvergenceTimedOut { last_values, .. }
            | Self::ConvergenceExhausted { last_values, .. } => Some(last_values.as_slice()),
            _ => None,
        }
    }

    /// JSON summary for CLI output and structured logs.
    pub fn to_json(&self) -> serde_json::Value {
        let mut json = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "context": self.context(),
        });
        if let Some(values) = self.last_values() {
            json["last_values"] = serde_json::json!(values);
        }
        json
    }
}
