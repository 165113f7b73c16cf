// ABOUTME: Step definition model: the closed set of step types and their payloads
// ABOUTME: Serde-tagged so an external loader can deserialize definitions directly

use crate::handler::ErrorHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single step in a workflow or sub-agent task definition.
///
/// Steps are immutable records; the executor works on expanded copies and
/// never mutates the definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Handler override for errors raised by this step. Absent means the
    /// per-step-type default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorHandler>,
    /// Step-level deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            on_error: None,
            timeout_ms: None,
        }
    }

    pub fn with_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// The closed set of step types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Apply one or more update operations to the state tier.
    StateUpdate { updates: Vec<UpdateOp> },

    /// Carry an expanded message string to the client.
    UserMessage { message: String },

    /// Carry a command string to the client; `capture` maps the submitted
    /// result (`result.stdout`, `result.stderr`, `result.exit_code`) into
    /// state when the client reports back.
    ShellCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        capture: Vec<UpdateOp>,
    },

    /// Carry a tool name and parameter map to the client; `capture` maps the
    /// submitted result into state.
    McpCall {
        tool: String,
        #[serde(default)]
        parameters: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        capture: Vec<UpdateOp>,
    },

    /// Prompt the user for input, validated against a JSON schema. Always
    /// closes the batch.
    UserInput {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        /// State path the validated response is written to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_path: Option<String>,
    },

    /// Prompt the driving agent itself. Always closes the batch.
    AgentPrompt { prompt: String },

    /// Evaluate `condition` against state and push one branch as a frame.
    Conditional {
        condition: String,
        #[serde(default)]
        then_steps: Vec<Step>,
        #[serde(default)]
        else_steps: Vec<Step>,
    },

    /// Push `body` repeatedly while `condition` is truthy, bounded by
    /// `max_iterations`.
    WhileLoop {
        condition: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        body: Vec<Step>,
    },

    /// Push `body` once per item of the `items` expression, binding
    /// `loop.item`, `loop.index`, `loop.total`. Items are evaluated once at
    /// entry.
    Foreach { items: String, body: Vec<Step> },

    /// Pop frames up to and including the innermost enclosing loop.
    Break,

    /// Pop frames up to the innermost enclosing loop and trigger the next
    /// iteration.
    Continue,

    /// Fan out `items` across sub-agent tasks with a concurrency cap.
    ParallelForeach {
        items: String,
        #[serde(default = "default_max_parallel")]
        max_parallel: usize,
        sub_agent_task: String,
        #[serde(default)]
        fan_in: FanInPolicy,
    },
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_parallel() -> usize {
    10
}

impl StepKind {
    /// Wire name of this step type.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::StateUpdate { .. } => "state_update",
            Self::UserMessage { .. } => "user_message",
            Self::ShellCommand { .. } => "shell_command",
            Self::McpCall { .. } => "mcp_call",
            Self::UserInput { .. } => "user_input",
            Self::AgentPrompt { .. } => "agent_prompt",
            Self::Conditional { .. } => "conditional",
            Self::WhileLoop { .. } => "while_loop",
            Self::Foreach { .. } => "foreach",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::ParallelForeach { .. } => "parallel_foreach",
        }
    }

    /// Server-internal steps advance in place and never appear in a client
    /// batch.
    pub fn is_server_internal(&self) -> bool {
        matches!(
            self,
            Self::StateUpdate { .. }
                | Self::Conditional { .. }
                | Self::WhileLoop { .. }
                | Self::Foreach { .. }
                | Self::Break
                | Self::Continue
        )
    }
}

/// A single state update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOp {
    pub path: String,
    pub value: Value,
    #[serde(default)]
    pub operation: UpdateKind,
}

impl UpdateOp {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            operation: UpdateKind::Set,
        }
    }

    pub fn increment(path: impl Into<String>, by: Value) -> Self {
        Self {
            path: path.into(),
            value: by,
            operation: UpdateKind::Increment,
        }
    }

    pub fn append(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            operation: UpdateKind::Append,
        }
    }
}

/// Write operation applied at a state path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    #[default]
    Set,
    Increment,
    Append,
}

/// Rule deciding when a parallel_foreach completes or fails given per-task
/// outcomes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FanInPolicy {
    /// First failure cancels the remaining tasks and fails the parent.
    #[default]
    FailFast,
    /// Run every task to a terminal state, then fail with the aggregate if
    /// any failed.
    CollectAll,
    /// Run every task; failures are logged and the parent continues.
    BestEffort,
    /// Fail only if the failed fraction exceeds `ratio`.
    Threshold { ratio: f64 },
}
