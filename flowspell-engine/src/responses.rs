// ABOUTME: Wire-shaped response types for the workflow RPC surface

use flowspell_core::WorkflowStatus;
use flowspell_state::StateSnapshot;
use serde::Serialize;
use serde_json::Value;

/// One step as delivered to the client, or as a record of a server-executed
/// step. `definition` carries the expanded payload (templates resolved).
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub definition: Value,
    /// Result payload for server-completed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Response to one `get_next_step` call: client-facing steps in order plus
/// records of the server-internal steps completed alongside.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepBatch {
    pub steps: Vec<StepRecord>,
    pub server_completed_steps: Vec<StepRecord>,
}

impl StepBatch {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.server_completed_steps.is_empty()
    }
}

/// Response to `workflow.start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub state: StateSnapshot,
    pub total_steps: usize,
}

/// Response to `get_next_sub_agent_step`. `None` at the service level means
/// the task has no further steps.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SubAgentStepResponse {
    /// The next client-facing step of the task.
    Step { step: StepRecord },
    /// The task was cancelled; no step is returned.
    Cancelled { cancelled: bool },
    /// The task exists but is not yet admitted (concurrency cap reached).
    Waiting { waiting: bool },
}

impl SubAgentStepResponse {
    pub fn cancelled() -> Self {
        Self::Cancelled { cancelled: true }
    }

    pub fn waiting() -> Self {
        Self::Waiting { waiting: true }
    }
}

/// Response to `submit_step_result`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub applied: bool,
}

/// Progress accounting for `workflow.status`.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub steps_executed: u64,
    pub total_steps: usize,
}

/// Response to `workflow.status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub state: StateSnapshot,
    pub progress: Progress,
}

/// One row of `workflow.list`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps_executed: u64,
}
