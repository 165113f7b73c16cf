// ABOUTME: Error layer: records, handler strategy dispatch, history tracking

pub mod handlers;
pub mod models;
pub mod tracking;

pub use handlers::{ErrorAction, HandlerRegistry};
pub use models::{CircuitPhase, CircuitState, ErrorContext, ErrorRecord, RetryState};
pub use tracking::{ErrorHistory, ErrorTracker};
