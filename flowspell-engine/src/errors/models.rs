// ABOUTME: Error records and per-step retry/circuit bookkeeping state

use chrono::{DateTime, Utc};
use flowspell_core::{new_error_id, FlowError, Severity};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

/// Where an error occurred.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_context: Option<Value>,
}

/// A recorded workflow error. Records are copied into history on insert;
/// nothing holds a reference back into live instances.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub recovered: bool,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,
}

impl ErrorRecord {
    pub fn from_flow_error(
        error: &FlowError,
        workflow_id: impl Into<String>,
        step_id: Option<String>,
    ) -> Self {
        Self {
            id: new_error_id(),
            workflow_id: workflow_id.into(),
            step_id,
            error_type: error.code().to_string(),
            message: error.to_string(),
            stack_trace: None,
            timestamp: Utc::now(),
            retry_count: 0,
            recovered: false,
            severity: error.severity(),
            context: None,
        }
    }

    /// Record for an error reported by the client as a step result. The
    /// client's own type string (e.g. `TimeoutError`) is preserved so retry
    /// filters can match on it.
    pub fn from_client_report(
        error_type: impl Into<String>,
        message: impl Into<String>,
        workflow_id: impl Into<String>,
        step_id: Option<String>,
    ) -> Self {
        Self {
            id: new_error_id(),
            workflow_id: workflow_id.into(),
            step_id,
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
            timestamp: Utc::now(),
            retry_count: 0,
            recovered: false,
            severity: Severity::Medium,
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-(workflow, step) retry bookkeeping. Cleared on success; purged when
/// the workflow reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempt_count: u32,
    pub last_attempt: Option<Instant>,
    pub next_retry: Option<Instant>,
    pub cumulative_delay_ms: u64,
    pub errors: Vec<ErrorRecord>,
}

impl RetryState {
    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.attempt_count < max_retries
    }

    pub fn add_error(&mut self, error: ErrorRecord) {
        self.errors.push(error);
        self.attempt_count += 1;
        self.last_attempt = Some(Instant::now());
    }
}

/// Circuit breaker phases. Transitions are closed -> open, open ->
/// half-open, half-open -> (closed | open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Per-(workflow, step) circuit breaker state.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
    pub next_attempt: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            last_failure: None,
            next_attempt: None,
        }
    }
}

impl CircuitState {
    /// Whether a dispatch is allowed now. An open circuit whose timeout has
    /// elapsed transitions to half-open and allows one trial.
    pub fn allow_attempt(&mut self, now: Instant) -> bool {
        match self.phase {
            CircuitPhase::Closed | CircuitPhase::HalfOpen => true,
            CircuitPhase::Open => match self.next_attempt {
                Some(at) if now >= at => {
                    self.phase = CircuitPhase::HalfOpen;
                    true
                }
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn record_from_flow_error_carries_code() {
        let err = FlowError::Timeout {
            message: "step deadline".into(),
        };
        let record = ErrorRecord::from_flow_error(&err, "wf_1", Some("s1".into()));
        assert_eq!(record.error_type, "TIMEOUT");
        assert!(record.id.starts_with("err_"));
        assert_eq!(record.severity, Severity::High);
    }

    #[test]
    fn retry_state_counts_attempts() {
        let mut state = RetryState::default();
        assert!(state.should_retry(2));
        state.add_error(ErrorRecord::from_client_report(
            "TimeoutError",
            "slow",
            "wf_1",
            None,
        ));
        assert_eq!(state.attempt_count, 1);
        assert!(state.should_retry(2));
        state.add_error(ErrorRecord::from_client_report(
            "TimeoutError",
            "slow again",
            "wf_1",
            None,
        ));
        assert!(!state.should_retry(2));
    }

    #[test]
    fn open_circuit_half_opens_after_timeout() {
        let start = Instant::now();
        let mut circuit = CircuitState {
            phase: CircuitPhase::Open,
            failure_count: 3,
            last_failure: Some(start),
            next_attempt: Some(start + Duration::from_millis(10)),
        };
        assert!(!circuit.allow_attempt(start));
        assert!(circuit.allow_attempt(start + Duration::from_millis(11)));
        assert_eq!(circuit.phase, CircuitPhase::HalfOpen);
    }
}
