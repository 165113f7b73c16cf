// ABOUTME: Core types, definitions, and error taxonomy for flowspell
// ABOUTME: Foundation layer shared by the expression, state, and engine crates

pub mod definition;
pub mod error;
pub mod handler;
pub mod ids;
pub mod step;
pub mod types;

pub use definition::{
    ComputedFieldDef, ComputedSources, InputDecl, SubAgentTaskDef, ValueType, WorkflowDefinition,
};
pub use error::{ErrorPayload, FlowError, Result, Severity};
pub use handler::{default_handler_for, ErrorHandler, ErrorStrategy};
pub use ids::{new_error_id, new_workflow_id, task_id_for};
pub use step::{FanInPolicy, Step, StepKind, UpdateKind, UpdateOp};
pub use types::{TaskStatus, WorkflowStatus};
