// ABOUTME: Test helpers: definition builders and canned client results
// ABOUTME: Used by the crate's integration tests; not part of the public API

use flowspell_core::{
    ComputedFieldDef, FanInPolicy, InputDecl, Step, StepKind, SubAgentTaskDef, UpdateOp,
    WorkflowDefinition,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Fluent builder for workflow definitions in tests.
pub struct DefinitionBuilder {
    definition: WorkflowDefinition,
}

impl DefinitionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            definition: WorkflowDefinition::new(name, Vec::new()),
        }
    }

    pub fn input(mut self, name: &str, decl: InputDecl) -> Self {
        self.definition.inputs.insert(name.to_string(), decl);
        self
    }

    pub fn default_state(mut self, key: &str, value: Value) -> Self {
        self.definition.default_state.insert(key.to_string(), value);
        self
    }

    pub fn computed(mut self, name: &str, from: &str, transform: &str) -> Self {
        self.definition
            .computed
            .insert(name.to_string(), ComputedFieldDef::single(from, transform));
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.definition.steps.push(step);
        self
    }

    pub fn sub_agent_task(mut self, name: &str, steps: Vec<Step>) -> Self {
        self.definition.sub_agent_tasks.insert(
            name.to_string(),
            SubAgentTaskDef {
                description: String::new(),
                inputs: BTreeMap::new(),
                steps,
            },
        );
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        self.definition
    }
}

/// Shorthand step constructors.
pub mod steps {
    use super::*;

    pub fn set(id: &str, path: &str, value: Value) -> Step {
        Step::new(
            id,
            StepKind::StateUpdate {
                updates: vec![UpdateOp::set(path, value)],
            },
        )
    }

    pub fn increment(id: &str, path: &str, by: Value) -> Step {
        Step::new(
            id,
            StepKind::StateUpdate {
                updates: vec![UpdateOp::increment(path, by)],
            },
        )
    }

    pub fn message(id: &str, text: &str) -> Step {
        Step::new(
            id,
            StepKind::UserMessage {
                message: text.to_string(),
            },
        )
    }

    pub fn shell(id: &str, command: &str) -> Step {
        Step::new(
            id,
            StepKind::ShellCommand {
                command: command.to_string(),
                capture: Vec::new(),
            },
        )
    }

    pub fn shell_capturing(id: &str, command: &str, path: &str, from: &str) -> Step {
        Step::new(
            id,
            StepKind::ShellCommand {
                command: command.to_string(),
                capture: vec![UpdateOp::set(path, Value::String(from.to_string()))],
            },
        )
    }

    pub fn mcp_call(id: &str, tool: &str, parameters: Value) -> Step {
        Step::new(
            id,
            StepKind::McpCall {
                tool: tool.to_string(),
                parameters,
                capture: Vec::new(),
            },
        )
    }

    pub fn conditional(id: &str, condition: &str, then_steps: Vec<Step>, else_steps: Vec<Step>) -> Step {
        Step::new(
            id,
            StepKind::Conditional {
                condition: condition.to_string(),
                then_steps,
                else_steps,
            },
        )
    }

    pub fn while_loop(id: &str, condition: &str, max_iterations: u32, body: Vec<Step>) -> Step {
        Step::new(
            id,
            StepKind::WhileLoop {
                condition: condition.to_string(),
                max_iterations,
                body,
            },
        )
    }

    pub fn foreach(id: &str, items: &str, body: Vec<Step>) -> Step {
        Step::new(
            id,
            StepKind::Foreach {
                items: items.to_string(),
                body,
            },
        )
    }

    pub fn break_step(id: &str) -> Step {
        Step::new(id, StepKind::Break)
    }

    pub fn continue_step(id: &str) -> Step {
        Step::new(id, StepKind::Continue)
    }

    pub fn parallel_foreach(
        id: &str,
        items: &str,
        max_parallel: usize,
        sub_agent_task: &str,
        fan_in: FanInPolicy,
    ) -> Step {
        Step::new(
            id,
            StepKind::ParallelForeach {
                items: items.to_string(),
                max_parallel,
                sub_agent_task: sub_agent_task.to_string(),
                fan_in,
            },
        )
    }
}

/// Plays the external AI agent: pulls batches and answers result-bearing
/// steps with whatever the responder returns. Stops at completion or at the
/// first step the responder declines to answer.
pub async fn drive_workflow(
    service: &crate::WorkflowService,
    workflow_id: &str,
    mut responder: impl FnMut(&crate::StepRecord) -> Option<Value>,
) -> flowspell_core::Result<()> {
    while let Some(batch) = service.get_next_step(workflow_id).await? {
        // sub-agent fan-outs are driven separately by the caller
        if batch
            .steps
            .iter()
            .any(|s| s.step_type == "parallel_foreach")
        {
            return Ok(());
        }
        for step in &batch.steps {
            if matches!(
                step.step_type.as_str(),
                "shell_command" | "mcp_call" | "user_input" | "agent_prompt"
            ) {
                match responder(step) {
                    Some(result) => {
                        service
                            .submit_step_result(workflow_id, &step.id, result)
                            .await?;
                    }
                    None => return Ok(()),
                }
            }
        }
    }
    Ok(())
}

/// Canned client-submitted results.
pub mod results {
    use super::*;

    pub fn shell_ok(stdout: &str) -> Value {
        json!({ "stdout": stdout, "stderr": "", "exit_code": 0 })
    }

    pub fn tool_ok(payload: Value) -> Value {
        payload
    }

    pub fn failure(error_type: &str, message: &str) -> Value {
        json!({ "error": { "type": error_type, "message": message } })
    }
}
