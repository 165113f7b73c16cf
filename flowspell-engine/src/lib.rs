// ABOUTME: Workflow engine: step executor, control flow, parallel coordinator,
// ABOUTME: error/retry layer, timeout manager, and the service facade

pub mod config;
pub mod control;
pub mod errors;
pub mod executor;
pub mod instance;
pub mod parallel;
pub mod queue;
pub mod responses;
pub mod service;
pub mod test_utils;
pub mod timeout;

pub use config::EngineConfig;
pub use errors::{CircuitPhase, ErrorRecord, ErrorTracker, HandlerRegistry};
pub use executor::{Executor, ParentAdvance, TaskAdvance};
pub use instance::WorkflowInstance;
pub use parallel::{ErrorAggregator, FanInVerdict, ParallelRun, SubAgentTask, TaskContext};
pub use queue::{FrameKind, QueueEvent, StepQueue};
pub use responses::{
    StartResponse, StatusResponse, StepBatch, StepRecord, SubAgentStepResponse, SubmitResponse,
    WorkflowSummary,
};
pub use service::WorkflowService;
pub use timeout::TimeoutManager;
