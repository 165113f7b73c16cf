// ABOUTME: Live workflow instance: status, queue, in-flight bookkeeping

use crate::parallel::ParallelRun;
use crate::queue::StepQueue;
use flowspell_core::{
    FlowError, Step, StepKind, UpdateOp, WorkflowDefinition, WorkflowStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// A client step that was handed out and may report back a result.
#[derive(Debug, Clone)]
pub struct PendingResult {
    /// The original step, kept for re-dispatch on retry.
    pub step: Step,
    /// Owning sub-agent task, when the step came from a task queue.
    pub task_id: Option<String>,
    /// Capture clause for shell/MCP results.
    pub capture: Vec<UpdateOp>,
    /// Validator and target path for user_input responses.
    pub schema: Option<Value>,
    pub state_path: Option<String>,
}

/// Live execution state of one workflow.
pub struct WorkflowInstance {
    pub id: String,
    pub definition: Arc<WorkflowDefinition>,
    pub status: WorkflowStatus,
    pub queue: StepQueue,
    pub steps_executed: u64,
    pub total_steps: usize,
    pub terminal_error: Option<FlowError>,
    /// In-flight parallel_foreach, if any.
    pub parallel: Option<ParallelRun>,
    /// Emitted client steps awaiting results, keyed by step id (parent) or
    /// `<task_id>/<step_id>` (sub-agent).
    pub pending: HashMap<String, PendingResult>,
    /// Parent-queue retry backoff: the next advance waits until this time.
    pub backoff_until: Option<Instant>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub terminal_at: Option<Instant>,
}

impl WorkflowInstance {
    pub fn new(id: String, definition: Arc<WorkflowDefinition>) -> Self {
        let total_steps = count_steps(&definition.steps);
        let queue = StepQueue::new(definition.steps.clone());
        let now = Instant::now();
        Self {
            id,
            definition,
            status: WorkflowStatus::Running,
            queue,
            steps_executed: 0,
            total_steps,
            terminal_error: None,
            parallel: None,
            pending: HashMap::new(),
            backoff_until: None,
            created_at: now,
            last_activity: now,
            terminal_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn mark_completed(&mut self) {
        if !self.status.is_terminal() {
            info!(workflow_id = %self.id, steps = self.steps_executed, "workflow completed");
            self.status = WorkflowStatus::Completed;
            self.terminal_at = Some(Instant::now());
        }
    }

    pub fn mark_failed(&mut self, error: FlowError) {
        if !self.status.is_terminal() {
            info!(workflow_id = %self.id, code = error.code(), "workflow failed");
            self.status = WorkflowStatus::Failed;
            self.terminal_error = Some(error);
            self.terminal_at = Some(Instant::now());
        }
    }

    /// Locate a pending entry by exact key or unique `<task>/<step>` suffix.
    pub fn find_pending_key(&self, step_id: &str) -> Option<String> {
        if self.pending.contains_key(step_id) {
            return Some(step_id.to_string());
        }
        let suffix = format!("/{step_id}");
        let mut matches = self.pending.keys().filter(|k| k.ends_with(&suffix));
        let found = matches.next().cloned();
        if matches.next().is_some() {
            return None; // ambiguous
        }
        found
    }
}

/// Static step count, nested bodies included (sub-agent tasks are counted
/// per fan-out, not here).
pub fn count_steps(steps: &[Step]) -> usize {
    let mut count = 0;
    for step in steps {
        count += 1;
        match &step.kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                count += count_steps(then_steps) + count_steps(else_steps);
            }
            StepKind::WhileLoop { body, .. } | StepKind::Foreach { body, .. } => {
                count += count_steps(body);
            }
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowspell_core::UpdateOp;
    use serde_json::json;

    #[test]
    fn count_includes_nested_bodies() {
        let steps = vec![
            Step::new(
                "outer",
                StepKind::WhileLoop {
                    condition: "true".into(),
                    max_iterations: 3,
                    body: vec![
                        Step::new(
                            "inner",
                            StepKind::Conditional {
                                condition: "true".into(),
                                then_steps: vec![Step::new("t", StepKind::Break)],
                                else_steps: vec![],
                            },
                        ),
                        Step::new(
                            "upd",
                            StepKind::StateUpdate {
                                updates: vec![UpdateOp::set("state.x", json!(1))],
                            },
                        ),
                    ],
                },
            ),
            Step::new(
                "tail",
                StepKind::UserMessage {
                    message: "done".into(),
                },
            ),
        ];
        assert_eq!(count_steps(&steps), 5);
    }

    #[test]
    fn terminal_transitions_are_sticky() {
        let def = Arc::new(WorkflowDefinition::new(
            "t",
            vec![Step::new(
                "m",
                StepKind::UserMessage {
                    message: "hi".into(),
                },
            )],
        ));
        let mut instance = WorkflowInstance::new("wf_x".into(), def);
        instance.mark_failed(FlowError::operation_failed("boom"));
        instance.mark_completed();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.terminal_error.is_some());
    }

    #[test]
    fn pending_lookup_by_suffix() {
        let def = Arc::new(WorkflowDefinition::new(
            "t",
            vec![Step::new(
                "m",
                StepKind::UserMessage {
                    message: "hi".into(),
                },
            )],
        ));
        let mut instance = WorkflowInstance::new("wf_x".into(), def);
        let pending = PendingResult {
            step: Step::new(
                "call",
                StepKind::McpCall {
                    tool: "t".into(),
                    parameters: json!({}),
                    capture: vec![],
                },
            ),
            task_id: Some("wf_x.parallel.0".into()),
            capture: vec![],
            schema: None,
            state_path: None,
        };
        instance
            .pending
            .insert("wf_x.parallel.0/call".into(), pending);
        assert_eq!(
            instance.find_pending_key("call"),
            Some("wf_x.parallel.0/call".to_string())
        );
        assert_eq!(
            instance.find_pending_key("wf_x.parallel.0/call"),
            Some("wf_x.parallel.0/call".to_string())
        );
        assert!(instance.find_pending_key("other").is_none());
    }
}
