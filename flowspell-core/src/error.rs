// ABOUTME: Closed error taxonomy for workflow execution
// ABOUTME: Sum type with payloads; string codes exist only at the wire boundary

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors the engine can produce. The set is closed: every failure in the
/// executor, state store, expression evaluator, and coordinator maps onto one
/// of these variants before it crosses any boundary.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("invalid path: {message}")]
    InvalidPath { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("condition evaluation failed: {message}")]
    ConditionEval { message: String },

    #[error("computed field '{field}' failed: {message}")]
    ComputedField { field: String, message: String },

    #[error("loop exceeded {max_iterations} iterations without terminating")]
    MaxIterationsExceeded { max_iterations: u32 },

    #[error("expression did not produce a sequence: {message}")]
    NonIterable { message: String },

    #[error("'break' used outside of a loop")]
    BreakOutsideLoop,

    #[error("'continue' used outside of a loop")]
    ContinueOutsideLoop,

    #[error("timed out: {message}")]
    Timeout { message: String },

    #[error("cancelled: {message}")]
    Cancelled { message: String },

    #[error("circuit open for step '{step_id}'")]
    CircuitOpen { step_id: String },

    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    #[error("operation failed: {message}")]
    OperationFailed { message: String },
}

impl FlowError {
    /// Wire-format error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidPath { .. } => "INVALID_PATH",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::ConditionEval { .. } => "CONDITION_EVAL_ERROR",
            Self::ComputedField { .. } => "COMPUTED_FIELD_ERROR",
            Self::MaxIterationsExceeded { .. } => "MAX_ITERATIONS_EXCEEDED",
            Self::NonIterable { .. } => "NON_ITERABLE",
            Self::BreakOutsideLoop => "BREAK_OUTSIDE_LOOP",
            Self::ContinueOutsideLoop => "CONTINUE_OUTSIDE_LOOP",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }

    /// Default severity used when recording this error in history.
    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidInput { .. }
            | Self::NotFound { .. }
            | Self::InvalidPath { .. }
            | Self::Validation { .. } => Severity::Medium,
            Self::ConditionEval { .. } | Self::ComputedField { .. } | Self::NonIterable { .. } => {
                Severity::Medium
            }
            Self::BreakOutsideLoop | Self::ContinueOutsideLoop => Severity::High,
            Self::MaxIterationsExceeded { .. } => Severity::High,
            Self::Timeout { .. } | Self::Cancelled { .. } => Severity::High,
            Self::CircuitOpen { .. } => Severity::High,
            Self::RetryExhausted { .. } | Self::OperationFailed { .. } => Severity::Critical,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }
}

/// Severity levels for error history records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Error envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<&FlowError> for ErrorPayload {
    fn from(err: &FlowError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            data: None,
        }
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, FlowError>;
