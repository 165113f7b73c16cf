// ABOUTME: Error handler configuration: strategy plus retry/circuit parameters
// ABOUTME: Includes the per-step-type default handler table

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Strategy applied when a step errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Propagate the error; the workflow becomes `failed`.
    Fail,
    /// Log and advance.
    Continue,
    /// Re-dispatch after an exponential backoff delay.
    Retry,
    /// Inject `fallback_value` as the step's result and advance.
    Fallback,
    /// Track failures per step; refuse execution while the circuit is open.
    CircuitBreaker,
}

/// Configuration for error handling behaviour at a suspension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandler {
    pub strategy: ErrorStrategy,

    // Retry parameters
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Jitter fraction applied to each delay (0.2 means +/-20%).
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Value injected as the step result under the `fallback` strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,

    /// When set, the handling outcome also writes the error record to this
    /// state path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_state_path: Option<String>,

    // Circuit breaker parameters
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,

    /// Allow-list of error kinds eligible for retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_error_types: Option<Vec<String>>,
    /// Deny-list of error kinds never retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_retry_on_error_types: Option<Vec<String>>,
}

fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_retry_jitter() -> f64 {
    0.2
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_circuit_timeout_ms() -> u64 {
    60_000
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorStrategy::Fail)
    }
}

impl ErrorHandler {
    pub fn new(strategy: ErrorStrategy) -> Self {
        Self {
            strategy,
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
            fallback_value: None,
            error_state_path: None,
            failure_threshold: default_failure_threshold(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
            retry_on_error_types: None,
            skip_retry_on_error_types: None,
        }
    }

    pub fn retry(count: u32, delay_ms: u64) -> Self {
        Self {
            strategy: ErrorStrategy::Retry,
            retry_count: count,
            retry_delay_ms: delay_ms,
            ..Self::new(ErrorStrategy::Retry)
        }
    }

    pub fn fallback(value: Value) -> Self {
        Self {
            fallback_value: Some(value),
            ..Self::new(ErrorStrategy::Fallback)
        }
    }

    pub fn circuit_breaker(failure_threshold: u32, circuit_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            circuit_timeout_ms,
            ..Self::new(ErrorStrategy::CircuitBreaker)
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.retry_max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_error_state_path(mut self, path: impl Into<String>) -> Self {
        self.error_state_path = Some(path.into());
        self
    }

    pub fn with_retry_params(mut self, count: u32, delay_ms: u64) -> Self {
        self.retry_count = count;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn retry_on(mut self, error_types: &[&str]) -> Self {
        self.retry_on_error_types = Some(error_types.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn skip_retry_on(mut self, error_types: &[&str]) -> Self {
        self.skip_retry_on_error_types = Some(error_types.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Whether this handler's retry filter admits the given error kind.
    /// Absent both lists, every kind is eligible.
    pub fn retry_admits(&self, error_type: &str) -> bool {
        if let Some(allow) = &self.retry_on_error_types {
            return allow.iter().any(|t| t == error_type);
        }
        if let Some(deny) = &self.skip_retry_on_error_types {
            return !deny.iter().any(|t| t == error_type);
        }
        true
    }
}

/// Default handler by step type, applied when a step has no `on_error`
/// override.
pub fn default_handler_for(step_type: &str) -> ErrorHandler {
    match step_type {
        "shell_command" => ErrorHandler::retry(2, 1000).retry_on(&[
            "TIMEOUT",
            "OPERATION_FAILED",
            "TimeoutError",
            "CalledProcessError",
            "ConnectionError",
        ]),
        "mcp_call" => ErrorHandler::retry(3, 500).retry_on(&[
            "TIMEOUT",
            "OPERATION_FAILED",
            "TimeoutError",
            "ConnectionError",
            "ServerError",
        ]),
        "user_input" => ErrorHandler::new(ErrorStrategy::Continue),
        _ => ErrorHandler::new(ErrorStrategy::Fail),
    }
}

/// Named handler profiles for common scenarios.
pub fn named_handler_profiles() -> Vec<(&'static str, ErrorHandler)> {
    vec![
        (
            "shell_command_transient",
            ErrorHandler::retry(3, 1000).retry_on(&[
                "CalledProcessError",
                "TimeoutError",
                "ConnectionError",
            ]),
        ),
        (
            "mcp_call_transient",
            ErrorHandler::retry(5, 500)
                .with_multiplier(1.5)
                .retry_on(&["ConnectionError", "TimeoutError", "ServerError"]),
        ),
        (
            "transformation_error",
            ErrorHandler::fallback(Value::Null)
                .with_error_state_path("raw.transformation_errors"),
        ),
        (
            "validation_error",
            ErrorHandler::new(ErrorStrategy::Fail)
                .with_error_state_path("raw.validation_errors"),
        ),
        (
            "external_service",
            ErrorHandler::circuit_breaker(5, 60_000).with_retry_params(3, 2000),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_filter_allow_list_wins() {
        let handler = ErrorHandler::retry(3, 100).retry_on(&["TIMEOUT"]);
        assert!(handler.retry_admits("TIMEOUT"));
        assert!(!handler.retry_admits("VALIDATION_ERROR"));
    }

    #[test]
    fn retry_filter_deny_list() {
        let handler = ErrorHandler::retry(3, 100).skip_retry_on(&["VALIDATION_ERROR"]);
        assert!(!handler.retry_admits("VALIDATION_ERROR"));
        assert!(handler.retry_admits("TIMEOUT"));
    }

    #[test]
    fn retry_filter_defaults_to_all() {
        let handler = ErrorHandler::retry(3, 100);
        assert!(handler.retry_admits("ANYTHING"));
    }

    #[test]
    fn named_profiles_carry_error_state_paths() {
        let profiles: std::collections::BTreeMap<_, _> =
            named_handler_profiles().into_iter().collect();
        assert_eq!(
            profiles["transformation_error"].error_state_path.as_deref(),
            Some("raw.transformation_errors")
        );
        assert_eq!(
            profiles["validation_error"].error_state_path.as_deref(),
            Some("raw.validation_errors")
        );
        let external = &profiles["external_service"];
        assert_eq!(external.strategy, ErrorStrategy::CircuitBreaker);
        assert_eq!(external.retry_count, 3);
        assert_eq!(external.retry_delay_ms, 2000);
    }

    #[test]
    fn step_type_defaults() {
        assert_eq!(
            default_handler_for("state_update").strategy,
            ErrorStrategy::Fail
        );
        assert_eq!(
            default_handler_for("shell_command").strategy,
            ErrorStrategy::Retry
        );
        assert_eq!(
            default_handler_for("user_input").strategy,
            ErrorStrategy::Continue
        );
    }
}
