// ABOUTME: Strategy dispatch for step errors: fail, continue, retry, fallback,
// ABOUTME: circuit breaker; holds the process-wide retry and circuit state maps

use crate::errors::models::{CircuitPhase, CircuitState, ErrorRecord, RetryState};
use dashmap::DashMap;
use flowspell_core::{ErrorHandler, ErrorStrategy};
use rand::Rng;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What the executor does next after funnelling an error through a handler.
#[derive(Debug, Clone)]
pub enum ErrorAction {
    /// Propagate; the workflow (or task) becomes failed.
    Fail,
    /// Log and advance past the step.
    Continue,
    /// Re-dispatch the step after the delay.
    Retry { delay: Duration, attempt: u32 },
    /// Inject the value as the step's successful result and advance.
    Fallback { value: Value },
    /// Circuit breaker recorded the failure; re-dispatch immediately, gated
    /// by the circuit at the next dispatch.
    CircuitRetry,
}

/// Process-wide registry of handlers plus the retry and circuit state keyed
/// by `workflow_id:step_id`.
#[derive(Default)]
pub struct HandlerRegistry {
    named: DashMap<String, ErrorHandler>,
    retry_states: DashMap<String, RetryState>,
    circuits: DashMap<String, CircuitState>,
}

fn state_key(workflow_id: &str, step_id: &str) -> String {
    format!("{workflow_id}:{step_id}")
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        for (name, handler) in flowspell_core::handler::named_handler_profiles() {
            registry.named.insert(name.to_string(), handler);
        }
        registry
    }

    pub fn register_named(&self, name: impl Into<String>, handler: ErrorHandler) {
        self.named.insert(name.into(), handler);
    }

    pub fn named(&self, name: &str) -> Option<ErrorHandler> {
        self.named.get(name).map(|h| h.clone())
    }

    /// Funnel one recorded error through a handler and decide the action.
    pub fn handle_error(&self, record: &ErrorRecord, handler: &ErrorHandler) -> ErrorAction {
        match handler.strategy {
            ErrorStrategy::Fail => {
                error!(
                    workflow_id = %record.workflow_id,
                    step_id = ?record.step_id,
                    error_type = %record.error_type,
                    "workflow step failed"
                );
                ErrorAction::Fail
            }
            ErrorStrategy::Continue => {
                warn!(
                    workflow_id = %record.workflow_id,
                    step_id = ?record.step_id,
                    "step error ignored, continuing"
                );
                ErrorAction::Continue
            }
            ErrorStrategy::Retry => self.handle_retry(record, handler),
            ErrorStrategy::Fallback => ErrorAction::Fallback {
                value: handler.fallback_value.clone().unwrap_or(Value::Null),
            },
            ErrorStrategy::CircuitBreaker => self.handle_circuit_failure(record, handler),
        }
    }

    fn handle_retry(&self, record: &ErrorRecord, handler: &ErrorHandler) -> ErrorAction {
        if !handler.retry_admits(&record.error_type) {
            info!(error_type = %record.error_type, "error type not eligible for retry");
            return ErrorAction::Fail;
        }

        let key = state_key(
            &record.workflow_id,
            record.step_id.as_deref().unwrap_or(""),
        );
        let mut state = self.retry_states.entry(key.clone()).or_default();
        if !state.should_retry(handler.retry_count) {
            error!(key = %key, max = handler.retry_count, "retries exhausted");
            return ErrorAction::Fail;
        }

        let delay = compute_delay(state.attempt_count, handler);
        state.add_error(record.clone());
        state.next_retry = Some(Instant::now() + delay);
        state.cumulative_delay_ms += delay.as_millis() as u64;
        info!(
            key = %key,
            delay_ms = delay.as_millis() as u64,
            attempt = state.attempt_count,
            max = handler.retry_count,
            "retry scheduled"
        );
        ErrorAction::Retry {
            delay,
            attempt: state.attempt_count,
        }
    }

    fn handle_circuit_failure(&self, record: &ErrorRecord, handler: &ErrorHandler) -> ErrorAction {
        let key = state_key(
            &record.workflow_id,
            record.step_id.as_deref().unwrap_or(""),
        );
        let mut circuit = self.circuits.entry(key.clone()).or_default();
        circuit.failure_count += 1;
        circuit.last_failure = Some(Instant::now());
        match circuit.phase {
            CircuitPhase::HalfOpen => {
                circuit.phase = CircuitPhase::Open;
                circuit.next_attempt =
                    Some(Instant::now() + Duration::from_millis(handler.circuit_timeout_ms));
                warn!(key = %key, "trial call failed, circuit re-opened");
            }
            CircuitPhase::Closed if circuit.failure_count >= handler.failure_threshold => {
                circuit.phase = CircuitPhase::Open;
                circuit.next_attempt =
                    Some(Instant::now() + Duration::from_millis(handler.circuit_timeout_ms));
                error!(
                    key = %key,
                    failures = circuit.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
        ErrorAction::CircuitRetry
    }

    /// Whether the circuit for a step admits a dispatch right now. An open
    /// circuit past its timeout moves to half-open and admits one trial.
    pub fn circuit_allows(&self, workflow_id: &str, step_id: &str) -> bool {
        let key = state_key(workflow_id, step_id);
        match self.circuits.get_mut(&key) {
            Some(mut circuit) => circuit.allow_attempt(Instant::now()),
            None => true,
        }
    }

    pub fn circuit_phase(&self, workflow_id: &str, step_id: &str) -> Option<CircuitPhase> {
        self.circuits
            .get(&state_key(workflow_id, step_id))
            .map(|c| c.phase)
    }

    /// Record a successful execution: retry state is cleared; a half-open
    /// circuit closes.
    pub fn record_success(&self, workflow_id: &str, step_id: &str) {
        let key = state_key(workflow_id, step_id);
        self.retry_states.remove(&key);
        if let Some(mut circuit) = self.circuits.get_mut(&key) {
            if circuit.phase == CircuitPhase::HalfOpen {
                circuit.phase = CircuitPhase::Closed;
                circuit.failure_count = 0;
                circuit.next_attempt = None;
                info!(key = %key, "circuit closed");
            }
        }
    }

    pub fn retry_attempts(&self, workflow_id: &str, step_id: &str) -> u32 {
        self.retry_states
            .get(&state_key(workflow_id, step_id))
            .map(|s| s.attempt_count)
            .unwrap_or(0)
    }

    /// Drop all retry and circuit state belonging to a workflow.
    pub fn purge_workflow(&self, workflow_id: &str) {
        let prefix = format!("{workflow_id}:");
        self.retry_states.retain(|k, _| !k.starts_with(&prefix));
        self.circuits.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Registry statistics as JSON.
    pub fn stats(&self) -> Value {
        let circuits: Vec<Value> = self
            .circuits
            .iter()
            .map(|entry| {
                json!({
                    "key": entry.key(),
                    "state": entry.value().phase,
                    "failure_count": entry.value().failure_count,
                })
            })
            .collect();
        let retries: Vec<Value> = self
            .retry_states
            .iter()
            .map(|entry| {
                json!({
                    "key": entry.key(),
                    "attempt_count": entry.value().attempt_count,
                    "cumulative_delay_ms": entry.value().cumulative_delay_ms,
                })
            })
            .collect();
        json!({
            "handlers_registered": self.named.len(),
            "circuit_breakers": circuits,
            "active_retries": retries,
        })
    }
}

/// Exponential backoff: `min(base * multiplier^attempt, max_delay)` with a
/// uniform jitter fraction and a 100ms floor.
fn compute_delay(attempt: u32, handler: &ErrorHandler) -> Duration {
    let base = handler.retry_delay_ms as f64
        * handler.retry_backoff_multiplier.powi(attempt as i32);
    let capped = base.min(handler.retry_max_delay_ms as f64);
    let jitter = if handler.retry_jitter > 0.0 {
        let spread = rand::thread_rng().gen_range(-1.0..=1.0);
        capped * handler.retry_jitter * spread
    } else {
        0.0
    };
    let final_ms = (capped + jitter).max(100.0);
    Duration::from_millis(final_ms as u64)
}
