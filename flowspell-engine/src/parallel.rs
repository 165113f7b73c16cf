// ABOUTME: Parallel fan-out coordinator: sub-agent task records, admission
// ABOUTME: capped at max_parallel, error aggregation, fan-in policies

use crate::errors::models::ErrorRecord;
use crate::queue::StepQueue;
use flowspell_core::{task_id_for, FanInPolicy, FlowError, SubAgentTaskDef, TaskStatus};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

/// Execution context handed to each sub-agent task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub item: Value,
    pub index: usize,
    pub total: usize,
    pub workflow_id: String,
}

impl TaskContext {
    pub fn to_json(&self) -> Value {
        json!({
            "item": self.item,
            "index": self.index,
            "total": self.total,
            "workflow_id": self.workflow_id,
        })
    }
}

/// One sub-agent task: isolated queue position and control flow; state writes
/// go to the parent workflow's store.
#[derive(Debug)]
pub struct SubAgentTask {
    pub task_id: String,
    pub context: TaskContext,
    pub inputs: Map<String, Value>,
    pub status: TaskStatus,
    pub queue: StepQueue,
    pub backoff_until: Option<Instant>,
}

impl SubAgentTask {
    pub fn summary_json(&self) -> Value {
        json!({
            "task_id": self.task_id,
            "context": self.context.to_json(),
            "inputs": self.inputs,
            "status": self.status,
        })
    }
}

/// Verdict of a fan-in evaluation.
#[derive(Debug)]
pub enum FanInVerdict {
    /// Tasks still have work to do.
    InFlight,
    /// The policy is satisfied; the parent advances past the step.
    Complete,
    /// The policy failed the parallel step; remaining tasks must cancel.
    Failed(FlowError),
}

/// Aggregates per-task errors for one parallel_foreach.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    task_errors: BTreeMap<String, ErrorRecord>,
    error_counts: BTreeMap<String, u64>,
    total_tasks: usize,
}

impl ErrorAggregator {
    pub fn new(total_tasks: usize) -> Self {
        Self {
            total_tasks,
            ..Self::default()
        }
    }

    pub fn add_task_error(&mut self, task_id: &str, error: ErrorRecord) {
        *self.error_counts.entry(error.error_type.clone()).or_default() += 1;
        self.task_errors.insert(task_id.to_string(), error);
    }

    pub fn failed_tasks(&self) -> usize {
        self.task_errors.len()
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.task_errors.len() as f64 / self.total_tasks as f64
        }
    }

    pub fn aggregated(&self) -> Vec<&ErrorRecord> {
        self.task_errors.values().collect()
    }

    pub fn first_error(&self) -> Option<&ErrorRecord> {
        self.task_errors.values().min_by_key(|e| e.timestamp)
    }

    pub fn summary(&self) -> Value {
        json!({
            "total_tasks": self.total_tasks,
            "failed_tasks": self.task_errors.len(),
            "success_rate": 1.0 - self.failure_rate(),
            "error_types": self.error_counts,
        })
    }
}

/// Live state of one parallel_foreach fan-out. Full-iteration semantics:
/// every item gets a task record; `max_parallel` bounds how many are
/// admitted to `running` at once.
#[derive(Debug)]
pub struct ParallelRun {
    pub step_id: String,
    pub fan_in: FanInPolicy,
    pub max_parallel: usize,
    pub tasks: Vec<SubAgentTask>,
    pub aggregator: ErrorAggregator,
}

impl ParallelRun {
    /// Materialise task records from the resolved items. `make_inputs`
    /// expands the task definition's input templates for each item.
    pub fn materialise(
        workflow_id: &str,
        step_id: &str,
        items: Vec<Value>,
        max_parallel: usize,
        fan_in: FanInPolicy,
        task_def: &SubAgentTaskDef,
        mut make_inputs: impl FnMut(&TaskContext) -> Map<String, Value>,
    ) -> Self {
        let total = items.len();
        let tasks: Vec<SubAgentTask> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let context = TaskContext {
                    item,
                    index,
                    total,
                    workflow_id: workflow_id.to_string(),
                };
                let inputs = make_inputs(&context);
                SubAgentTask {
                    task_id: task_id_for(workflow_id, index),
                    context,
                    inputs,
                    status: TaskStatus::Pending,
                    queue: StepQueue::new(task_def.steps.clone()),
                    backoff_until: None,
                }
            })
            .collect();
        info!(
            workflow_id,
            step_id,
            tasks = tasks.len(),
            max_parallel,
            "parallel fan-out materialised"
        );
        Self {
            step_id: step_id.to_string(),
            fan_in,
            max_parallel,
            aggregator: ErrorAggregator::new(total),
            tasks,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&SubAgentTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut SubAgentTask> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// Admit a pending task if the concurrency cap allows. Returns whether
    /// the task is now running.
    pub fn try_admit(&mut self, task_id: &str) -> bool {
        let running = self.running_count();
        let max_parallel = self.max_parallel;
        let Some(task) = self.task_mut(task_id) else {
            return false;
        };
        match task.status {
            TaskStatus::Running => true,
            TaskStatus::Pending if running < max_parallel => {
                task.status = TaskStatus::Running;
                true
            }
            _ => false,
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Cancel every non-terminal task; returns the cancelled ids.
    pub fn cancel_remaining(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for task in &mut self.tasks {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                cancelled.push(task.task_id.clone());
            }
        }
        if !cancelled.is_empty() {
            warn!(step_id = %self.step_id, count = cancelled.len(), "cancelled remaining tasks");
        }
        cancelled
    }

    /// Apply the fan-in policy to the current task states.
    pub fn evaluate(&self) -> FanInVerdict {
        let failed = self.aggregator.failed_tasks();
        match &self.fan_in {
            FanInPolicy::FailFast if failed > 0 => {
                FanInVerdict::Failed(self.aggregate_error("fail_fast"))
            }
            FanInPolicy::Threshold { ratio } if self.aggregator.failure_rate() > *ratio => {
                FanInVerdict::Failed(self.aggregate_error("threshold"))
            }
            FanInPolicy::CollectAll if self.all_terminal() && failed > 0 => {
                FanInVerdict::Failed(self.aggregate_error("collect_all"))
            }
            _ if self.all_terminal() => {
                if failed > 0 {
                    warn!(
                        step_id = %self.step_id,
                        failed,
                        total = self.tasks.len(),
                        "parallel step completing despite task failures"
                    );
                }
                FanInVerdict::Complete
            }
            _ => FanInVerdict::InFlight,
        }
    }

    fn aggregate_error(&self, policy: &str) -> FlowError {
        let first = self
            .aggregator
            .first_error()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "task failure".to_string());
        FlowError::operation_failed(format!(
            "{}/{} sub-agent tasks failed ({policy}): {first}",
            self.aggregator.failed_tasks(),
            self.tasks.len(),
        ))
    }

    /// The `tasks` array for the expanded parallel_foreach definition.
    pub fn tasks_json(&self) -> Value {
        Value::Array(self.tasks.iter().map(SubAgentTask::summary_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowspell_core::{Step, StepKind};
    use serde_json::json;

    fn task_def() -> SubAgentTaskDef {
        SubAgentTaskDef {
            description: String::new(),
            inputs: BTreeMap::new(),
            steps: vec![Step::new(
                "work",
                StepKind::UserMessage {
                    message: "processing {{ item }}".into(),
                },
            )],
        }
    }

    fn run(items: usize, max_parallel: usize, fan_in: FanInPolicy) -> ParallelRun {
        let items: Vec<Value> = (0..items).map(|i| json!(format!("item{i}"))).collect();
        ParallelRun::materialise(
            "wf_p",
            "fan",
            items,
            max_parallel,
            fan_in,
            &task_def(),
            |_| Map::new(),
        )
    }

    fn fail_task(run: &mut ParallelRun, index: usize) {
        let task_id = run.tasks[index].task_id.clone();
        run.task_mut(&task_id).unwrap().status = TaskStatus::Failed;
        let record =
            ErrorRecord::from_client_report("OPERATION_FAILED", "boom", "wf_p", Some("work".into()));
        run.aggregator.add_task_error(&task_id, record);
    }

    #[test]
    fn materialise_creates_one_task_per_item() {
        let run = run(4, 2, FanInPolicy::FailFast);
        assert_eq!(run.tasks.len(), 4);
        assert_eq!(run.tasks[2].task_id, "wf_p.parallel.2");
        assert_eq!(run.tasks[2].context.index, 2);
        assert_eq!(run.tasks[2].context.total, 4);
        assert_eq!(run.tasks[2].context.item, json!("item2"));
    }

    #[test]
    fn admission_respects_max_parallel() {
        let mut run = run(4, 2, FanInPolicy::FailFast);
        let ids: Vec<String> = run.tasks.iter().map(|t| t.task_id.clone()).collect();
        assert!(run.try_admit(&ids[0]));
        assert!(run.try_admit(&ids[1]));
        assert!(!run.try_admit(&ids[2]), "cap of 2 must hold");
        assert_eq!(run.running_count(), 2);

        // a terminal task frees a slot
        run.task_mut(&ids[0]).unwrap().status = TaskStatus::Completed;
        assert!(run.try_admit(&ids[2]));
        assert_eq!(run.running_count(), 2);
    }

    #[test]
    fn fail_fast_fails_on_first_error() {
        let mut run = run(3, 3, FanInPolicy::FailFast);
        assert!(matches!(run.evaluate(), FanInVerdict::InFlight));
        fail_task(&mut run, 1);
        match run.evaluate() {
            FanInVerdict::Failed(err) => assert_eq!(err.code(), "OPERATION_FAILED"),
            other => panic!("expected failure, got {other:?}"),
        }
        let cancelled = run.cancel_remaining();
        assert_eq!(cancelled.len(), 2);
        assert!(run.all_terminal());
    }

    #[test]
    fn collect_all_waits_for_every_task() {
        let mut run = run(2, 2, FanInPolicy::CollectAll);
        fail_task(&mut run, 0);
        assert!(matches!(run.evaluate(), FanInVerdict::InFlight));
        let other = run.tasks[1].task_id.clone();
        run.task_mut(&other).unwrap().status = TaskStatus::Completed;
        assert!(matches!(run.evaluate(), FanInVerdict::Failed(_)));
    }

    #[test]
    fn best_effort_completes_despite_failures() {
        let mut run = run(2, 2, FanInPolicy::BestEffort);
        fail_task(&mut run, 0);
        let other = run.tasks[1].task_id.clone();
        run.task_mut(&other).unwrap().status = TaskStatus::Completed;
        assert!(matches!(run.evaluate(), FanInVerdict::Complete));
    }

    #[test]
    fn threshold_triggers_above_ratio() {
        let mut run = run(4, 4, FanInPolicy::Threshold { ratio: 0.5 });
        fail_task(&mut run, 0);
        fail_task(&mut run, 1);
        // exactly 0.5 does not exceed the ratio
        assert!(matches!(run.evaluate(), FanInVerdict::InFlight));
        fail_task(&mut run, 2);
        assert!(matches!(run.evaluate(), FanInVerdict::Failed(_)));
    }

    #[test]
    fn empty_fan_out_completes_immediately() {
        let run = run(0, 2, FanInPolicy::FailFast);
        assert!(matches!(run.evaluate(), FanInVerdict::Complete));
    }

    #[test]
    fn aggregator_summary() {
        let mut run = run(4, 2, FanInPolicy::CollectAll);
        fail_task(&mut run, 0);
        fail_task(&mut run, 3);
        let summary = run.aggregator.summary();
        assert_eq!(summary["failed_tasks"], 2);
        assert_eq!(summary["total_tasks"], 4);
        assert_eq!(summary["error_types"]["OPERATION_FAILED"], 2);
    }
}
