// ABOUTME: The step executor: pops from the queue, expands templates,
// ABOUTME: executes server-internal steps in place, batches client steps

use crate::control;
use crate::errors::handlers::{ErrorAction, HandlerRegistry};
use crate::errors::models::{ErrorContext, ErrorRecord};
use crate::errors::tracking::ErrorTracker;
use crate::instance::{PendingResult, WorkflowInstance};
use crate::parallel::{FanInVerdict, ParallelRun, TaskContext};
use crate::queue::{QueueEvent, StepQueue};
use crate::responses::{StepBatch, StepRecord};
use crate::timeout::TimeoutManager;
use flowspell_core::{
    default_handler_for, ErrorHandler, ErrorStrategy, FlowError, Result, Step, StepKind,
    TaskStatus, UpdateOp, WorkflowStatus,
};
use flowspell_expr::{expand_string, expand_value};
use flowspell_state::StateStore;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Outcome of one parent advance pass.
#[derive(Debug)]
pub enum ParentAdvance {
    /// A batch is ready for the client.
    Batch(StepBatch),
    /// The queue is exhausted and nothing is left to deliver.
    Finished,
    /// A retry backoff is pending; wait this long and re-enter.
    Sleep(Duration),
}

/// Outcome of one sub-agent task advance pass.
#[derive(Debug)]
pub enum TaskAdvance {
    Step(StepRecord),
    Cancelled,
    Waiting,
    Done,
    Sleep(Duration),
}

/// What to do after funnelling a step error through its handler.
enum ErrorFlow {
    Advance,
    AdvanceWith(Value),
    Backoff(Duration),
    Requeue,
}

/// Inner result of the task loop, resolved once the run borrow is released.
enum TaskStepOutcome {
    Finished(TaskAdvance),
    TaskFailed(FlowError),
    Emit(StepRecord, String, PendingResult),
}

/// The queue-driven step executor. Shared by the parent workflow loop and
/// every sub-agent task loop.
pub struct Executor {
    pub store: Arc<StateStore>,
    pub handlers: Arc<HandlerRegistry>,
    pub tracker: Arc<ErrorTracker>,
    pub timeouts: Arc<TimeoutManager>,
}

impl Executor {
    /// Advance the parent workflow until a batch is ready, the workflow
    /// finishes, or a backoff requires waiting. Never blocks.
    #[instrument(skip_all, fields(workflow_id = %inst.id))]
    pub fn advance_parent(&self, inst: &mut WorkflowInstance) -> Result<ParentAdvance> {
        let mut batch = StepBatch::default();

        // implicit completion: parent steps returned in a previous batch are
        // treated as done; unsubmitted results are forfeited
        self.forfeit_pending(inst, None);

        if let Some(until) = inst.backoff_until {
            let now = Instant::now();
            if until > now {
                return Ok(ParentAdvance::Sleep(until - now));
            }
            inst.backoff_until = None;
        }

        loop {
            if inst.parallel.is_some() {
                match self.check_fan_in(inst)? {
                    Some(record) => {
                        inst.status = WorkflowStatus::Blocked;
                        batch.steps.push(record);
                        return Ok(ParentAdvance::Batch(batch));
                    }
                    None => {
                        inst.status = WorkflowStatus::Running;
                    }
                }
            }

            match inst.queue.advance() {
                QueueEvent::Empty => {
                    // steps emitted in this batch may still report results
                    // that requeue them; completion waits for the next call
                    let awaiting = inst.pending.values().any(|p| p.task_id.is_none());
                    if awaiting {
                        return Ok(ParentAdvance::Batch(batch));
                    }
                    inst.mark_completed();
                    self.handlers.purge_workflow(&inst.id);
                    if batch.is_empty() {
                        return Ok(ParentAdvance::Finished);
                    }
                    return Ok(ParentAdvance::Batch(batch));
                }
                QueueEvent::FrameExhausted(kind) => {
                    let scope = self.build_scope(&inst.id, inst.queue.loop_bindings(), None)?;
                    if let Err(err) = control::continue_loop_frame(&mut inst.queue, kind, &scope)
                    {
                        let record = ErrorRecord::from_flow_error(&err, &inst.id, None);
                        self.tracker.track(record, Some("fail"));
                        inst.mark_failed(err.clone());
                        return Err(err);
                    }
                }
                QueueEvent::Step(step) => {
                    // circuit gate: refuse any dispatch while the circuit is
                    // open, regardless of step class
                    let handler = effective_handler(&step);
                    if handler.strategy == ErrorStrategy::CircuitBreaker
                        && !self.handlers.circuit_allows(&inst.id, &step.id)
                    {
                        let err = FlowError::CircuitOpen {
                            step_id: step.id.clone(),
                        };
                        let record =
                            ErrorRecord::from_flow_error(&err, &inst.id, Some(step.id.clone()));
                        self.tracker.track(record, Some("circuit_breaker"));
                        inst.queue.push_front_step(step);
                        return Err(err);
                    }

                    let scope = self.build_scope(&inst.id, inst.queue.loop_bindings(), None)?;
                    if step.kind.is_server_internal() {
                        match self.run_server_step(&inst.id, &mut inst.queue, &step, &scope) {
                            Ok((definition, result)) => {
                                inst.steps_executed += 1;
                                self.handlers.record_success(&inst.id, &step.id);
                                batch.server_completed_steps.push(StepRecord {
                                    id: step.id.clone(),
                                    step_type: step.kind.kind_name().to_string(),
                                    definition,
                                    result: Some(result),
                                });
                            }
                            Err(err) => match self.handle_parent_error(inst, &step, err)? {
                                ErrorFlow::Advance => {}
                                ErrorFlow::AdvanceWith(value) => {
                                    inst.steps_executed += 1;
                                    batch.server_completed_steps.push(StepRecord {
                                        id: step.id.clone(),
                                        step_type: step.kind.kind_name().to_string(),
                                        definition: Value::Null,
                                        result: Some(value),
                                    });
                                }
                                ErrorFlow::Backoff(delay) => {
                                    inst.queue.push_front_step(step);
                                    inst.backoff_until = Some(Instant::now() + delay);
                                    if batch.is_empty() {
                                        return Ok(ParentAdvance::Sleep(delay));
                                    }
                                    return Ok(ParentAdvance::Batch(batch));
                                }
                                ErrorFlow::Requeue => {
                                    inst.queue.push_front_step(step);
                                }
                            },
                        }
                    } else if let StepKind::ParallelForeach { .. } = &step.kind {
                        if let Some(record) = self.start_parallel(inst, &step, &scope)? {
                            inst.steps_executed += 1;
                            batch.steps.push(record);
                            return Ok(ParentAdvance::Batch(batch));
                        }
                        // empty fan-out: the step completes in place and the
                        // parent advances without spawning tasks
                        inst.steps_executed += 1;
                        batch.server_completed_steps.push(StepRecord {
                            id: step.id.clone(),
                            step_type: step.kind.kind_name().to_string(),
                            definition: json!({ "tasks": [] }),
                            result: Some(json!({ "tasks": 0 })),
                        });
                    } else {
                        let record = self.emit_client_step(inst, &step, &scope);
                        inst.steps_executed += 1;
                        let closes = closes_batch(&step.kind);
                        batch.steps.push(record);
                        if closes {
                            return Ok(ParentAdvance::Batch(batch));
                        }
                    }
                }
            }
        }
    }

    /// Advance one sub-agent task to its next client-facing step.
    #[instrument(skip_all, fields(workflow_id = %inst.id, task_id = %task_id))]
    pub fn advance_task(&self, inst: &mut WorkflowInstance, task_id: &str) -> Result<TaskAdvance> {
        let inst_id = inst.id.clone();

        // implicit completion for this task's previously returned step
        self.forfeit_pending(inst, Some(task_id));

        let outcome = {
            let run = inst.parallel.as_mut().ok_or_else(|| {
                FlowError::not_found(format!("no parallel step in flight for '{inst_id}'"))
            })?;
            let status = run
                .task(task_id)
                .map(|t| t.status)
                .ok_or_else(|| FlowError::not_found(format!("task '{task_id}'")))?;

            match status {
                TaskStatus::Cancelled => TaskStepOutcome::Finished(TaskAdvance::Cancelled),
                TaskStatus::Completed | TaskStatus::Failed => {
                    TaskStepOutcome::Finished(TaskAdvance::Done)
                }
                TaskStatus::Pending if !run.try_admit(task_id) => {
                    TaskStepOutcome::Finished(TaskAdvance::Waiting)
                }
                _ => self.drive_task(&inst_id, run, task_id)?,
            }
        };

        match outcome {
            TaskStepOutcome::Finished(advance) => {
                if matches!(advance, TaskAdvance::Done) {
                    self.settle_fan_in_failure(inst);
                }
                Ok(advance)
            }
            TaskStepOutcome::TaskFailed(err) => {
                self.settle_fan_in_failure(inst);
                Err(err)
            }
            TaskStepOutcome::Emit(record, key, pending) => {
                if accepts_result(&pending.step.kind) {
                    if let Some(timeout_ms) = pending.step.timeout_ms {
                        let step_key = TimeoutManager::step_key(&inst_id, &key);
                        self.timeouts
                            .set_deadline(step_key.clone(), Duration::from_millis(timeout_ms));
                        // cascade under the parallel step's deadline when it
                        // has one, otherwise under the workflow's
                        let parent_key = inst
                            .parallel
                            .as_ref()
                            .map(|run| TimeoutManager::step_key(&inst_id, &run.step_id))
                            .filter(|k| self.timeouts.has_deadline(k))
                            .unwrap_or_else(|| inst_id.clone());
                        self.timeouts.link(parent_key, step_key);
                    }
                    inst.pending.insert(key, pending);
                }
                inst.steps_executed += 1;
                inst.touch();
                Ok(TaskAdvance::Step(record))
            }
        }
    }

    /// Inner task loop: runs server-internal steps, stops at the first
    /// client-facing step or at task completion.
    fn drive_task(
        &self,
        inst_id: &str,
        run: &mut ParallelRun,
        task_id: &str,
    ) -> Result<TaskStepOutcome> {
        loop {
            let task = run
                .task_mut(task_id)
                .ok_or_else(|| FlowError::not_found(format!("task '{task_id}'")))?;

            if let Some(until) = task.backoff_until {
                let now = Instant::now();
                if until > now {
                    return Ok(TaskStepOutcome::Finished(TaskAdvance::Sleep(until - now)));
                }
                task.backoff_until = None;
            }

            let task_bindings = task_scope_bindings(&task.context, &task.inputs);

            match task.queue.advance() {
                QueueEvent::Empty => {
                    task.status = TaskStatus::Completed;
                    debug!(task_id, "sub-agent task completed");
                    return Ok(TaskStepOutcome::Finished(TaskAdvance::Done));
                }
                QueueEvent::FrameExhausted(kind) => {
                    let scope = self.build_scope(
                        inst_id,
                        task.queue.loop_bindings(),
                        Some(task_bindings),
                    )?;
                    if let Err(err) = control::continue_loop_frame(&mut task.queue, kind, &scope)
                    {
                        return Ok(self.fail_task(inst_id, run, task_id, None, err));
                    }
                }
                QueueEvent::Step(step) => {
                    let loop_bindings = task.queue.loop_bindings();

                    let handler = effective_handler(&step);
                    if handler.strategy == ErrorStrategy::CircuitBreaker
                        && !self.handlers.circuit_allows(inst_id, &step.id)
                    {
                        let err = FlowError::CircuitOpen {
                            step_id: step.id.clone(),
                        };
                        let record =
                            ErrorRecord::from_flow_error(&err, inst_id, Some(step.id.clone()));
                        self.tracker.track(record, Some("circuit_breaker"));
                        let task = run.task_mut(task_id).expect("task exists");
                        task.queue.push_front_step(step);
                        return Err(err);
                    }

                    let scope =
                        self.build_scope(inst_id, loop_bindings, Some(task_bindings))?;
                    if step.kind.is_server_internal() {
                        let attempt = {
                            let task = run.task_mut(task_id).expect("task exists");
                            self.run_server_step(inst_id, &mut task.queue, &step, &scope)
                        };
                        match attempt {
                            Ok(_) => {
                                self.handlers.record_success(inst_id, &step.id);
                            }
                            Err(err) => {
                                let record = ErrorRecord::from_flow_error(
                                    &err,
                                    inst_id,
                                    Some(step.id.clone()),
                                );
                                match self.dispatch_error(
                                    inst_id,
                                    &step,
                                    Some(task_id),
                                    record,
                                    &err,
                                ) {
                                    Ok(ErrorFlow::Advance)
                                    | Ok(ErrorFlow::AdvanceWith(_)) => {}
                                    Ok(ErrorFlow::Backoff(delay)) => {
                                        let task =
                                            run.task_mut(task_id).expect("task exists");
                                        task.queue.push_front_step(step);
                                        task.backoff_until = Some(Instant::now() + delay);
                                        return Ok(TaskStepOutcome::Finished(
                                            TaskAdvance::Sleep(delay),
                                        ));
                                    }
                                    Ok(ErrorFlow::Requeue) => {
                                        let task =
                                            run.task_mut(task_id).expect("task exists");
                                        task.queue.push_front_step(step);
                                    }
                                    Err(terminal) => {
                                        return Ok(self.fail_task(
                                            inst_id,
                                            run,
                                            task_id,
                                            Some(&step),
                                            terminal,
                                        ));
                                    }
                                }
                            }
                        }
                    } else {
                        if matches!(step.kind, StepKind::ParallelForeach { .. }) {
                            let err = FlowError::validation(
                                "nested parallel_foreach inside a sub-agent task is not supported",
                            );
                            return Ok(self.fail_task(inst_id, run, task_id, Some(&step), err));
                        }
                        let (record, mut pending) = self.build_client_record(&step, &scope);
                        pending.task_id = Some(task_id.to_string());
                        let key = format!("{task_id}/{}", step.id);
                        return Ok(TaskStepOutcome::Emit(record, key, pending));
                    }
                }
            }
        }
    }

    /// Mark a task failed, feed the aggregator, and cancel siblings when the
    /// fan-in policy says so. The parent's terminal status is settled by
    /// `settle_fan_in_failure` once the run borrow ends.
    fn fail_task(
        &self,
        inst_id: &str,
        run: &mut ParallelRun,
        task_id: &str,
        step: Option<&Step>,
        err: FlowError,
    ) -> TaskStepOutcome {
        let record = ErrorRecord::from_flow_error(&err, inst_id, step.map(|s| s.id.clone()))
            .with_context(ErrorContext {
                workflow_id: inst_id.to_string(),
                step_id: step.map(|s| s.id.clone()),
                task_id: Some(task_id.to_string()),
                execution_context: None,
            });
        self.tracker.track(record.clone(), Some("fail"));
        if let Some(task) = run.task_mut(task_id) {
            task.status = TaskStatus::Failed;
        }
        run.aggregator.add_task_error(task_id, record);
        if let FanInVerdict::Failed(_) = run.evaluate() {
            run.cancel_remaining();
        }
        TaskStepOutcome::TaskFailed(err)
    }

    /// After a task reached a terminal state, apply any fan-in failure to
    /// the parent instance.
    pub fn settle_fan_in_failure(&self, inst: &mut WorkflowInstance) {
        let verdict = match inst.parallel.as_ref() {
            Some(run) => run.evaluate(),
            None => return,
        };
        if let FanInVerdict::Failed(err) = verdict {
            if let Some(run) = inst.parallel.as_mut() {
                run.cancel_remaining();
            }
            let record = ErrorRecord::from_flow_error(&err, &inst.id, None);
            self.tracker.track(record, Some("fail"));
            inst.mark_failed(err);
        }
    }

    /// Check an in-flight fan-out from the parent side. Returns a re-poll
    /// step record while tasks are live, `None` once resolved.
    fn check_fan_in(&self, inst: &mut WorkflowInstance) -> Result<Option<StepRecord>> {
        let verdict = inst
            .parallel
            .as_ref()
            .map(|run| run.evaluate())
            .expect("caller checked parallel");
        match verdict {
            FanInVerdict::Complete => {
                let run = inst.parallel.take().expect("present");
                debug!(step_id = %run.step_id, "parallel fan-in complete");
                Ok(None)
            }
            FanInVerdict::Failed(err) => {
                if let Some(run) = inst.parallel.as_mut() {
                    run.cancel_remaining();
                }
                let record = ErrorRecord::from_flow_error(&err, &inst.id, None);
                self.tracker.track(record, Some("fail"));
                inst.mark_failed(err.clone());
                Err(err)
            }
            FanInVerdict::InFlight => {
                let run = inst.parallel.as_ref().expect("present");
                Ok(Some(StepRecord {
                    id: run.step_id.clone(),
                    step_type: "parallel_foreach".to_string(),
                    definition: json!({
                        "max_parallel": run.max_parallel,
                        "tasks": run.tasks_json(),
                    }),
                    result: None,
                }))
            }
        }
    }

    /// Materialise a parallel_foreach. Returns `None` for an empty item
    /// sequence (the step completes in place).
    fn start_parallel(
        &self,
        inst: &mut WorkflowInstance,
        step: &Step,
        scope: &Map<String, Value>,
    ) -> Result<Option<StepRecord>> {
        let StepKind::ParallelForeach {
            items,
            max_parallel,
            sub_agent_task,
            fan_in,
        } = &step.kind
        else {
            return Err(FlowError::validation("not a parallel_foreach step"));
        };

        let resolved = match control::eval_items(items, scope) {
            Ok(values) => values,
            Err(err) => {
                let record =
                    ErrorRecord::from_flow_error(&err, &inst.id, Some(step.id.clone()));
                self.tracker.track(record, Some("fail"));
                inst.mark_failed(err.clone());
                return Err(err);
            }
        };
        if resolved.is_empty() {
            return Ok(None);
        }

        let task_def = inst
            .definition
            .sub_agent_tasks
            .get(sub_agent_task)
            .ok_or_else(|| FlowError::not_found(format!("sub_agent_task '{sub_agent_task}'")))?
            .clone();

        let base_scope = scope.clone();
        let run = ParallelRun::materialise(
            &inst.id,
            &step.id,
            resolved,
            *max_parallel,
            fan_in.clone(),
            &task_def,
            |context| {
                let mut task_scope = base_scope.clone();
                for (k, v) in task_scope_bindings(context, &Map::new()) {
                    task_scope.insert(k, v);
                }
                let mut out = Map::new();
                for (name, template) in &task_def.inputs {
                    out.insert(name.clone(), expand_value(template, &task_scope));
                }
                out
            },
        );

        let record = StepRecord {
            id: step.id.clone(),
            step_type: "parallel_foreach".to_string(),
            definition: json!({
                "max_parallel": run.max_parallel,
                "sub_agent_task": sub_agent_task,
                "fan_in": fan_in,
                "tasks": run.tasks_json(),
            }),
            result: None,
        };
        if let Some(timeout_ms) = step.timeout_ms {
            let step_key = TimeoutManager::step_key(&inst.id, &step.id);
            self.timeouts
                .set_deadline(step_key.clone(), Duration::from_millis(timeout_ms));
            self.timeouts.link(inst.id.clone(), step_key);
        }
        inst.parallel = Some(run);
        inst.status = WorkflowStatus::Blocked;
        Ok(Some(record))
    }

    /// Execute one server-internal step. Returns the expanded definition and
    /// a result payload.
    fn run_server_step(
        &self,
        inst_id: &str,
        queue: &mut StepQueue,
        step: &Step,
        scope: &Map<String, Value>,
    ) -> Result<(Value, Value)> {
        match &step.kind {
            StepKind::StateUpdate { updates } => {
                let ops = expand_update_ops(updates, scope)?;
                let outcome = self.store.update(inst_id, &ops)?;
                for err in outcome.computed_errors {
                    let record =
                        ErrorRecord::from_flow_error(&err, inst_id, Some(step.id.clone()));
                    self.tracker.track(record, Some("continue"));
                }
                let paths: Vec<Value> =
                    ops.iter().map(|op| Value::String(op.path.clone())).collect();
                Ok((json!({ "updates": ops }), json!({ "updated": paths })))
            }
            StepKind::Conditional {
                condition,
                then_steps,
                else_steps,
            } => {
                let result =
                    control::enter_conditional(queue, condition, then_steps, else_steps, scope)?;
                Ok((json!({ "condition": condition }), result))
            }
            StepKind::WhileLoop {
                condition,
                max_iterations,
                body,
            } => {
                let result =
                    control::enter_while(queue, &step.id, condition, *max_iterations, body, scope)?;
                Ok((
                    json!({ "condition": condition, "max_iterations": max_iterations }),
                    result,
                ))
            }
            StepKind::Foreach { items, body } => {
                let result = control::enter_foreach(queue, &step.id, items, body, scope)?;
                Ok((json!({ "items": items }), result))
            }
            StepKind::Break => {
                queue.break_loop()?;
                Ok((Value::Null, json!({ "break": true })))
            }
            StepKind::Continue => {
                queue.continue_loop()?;
                Ok((Value::Null, json!({ "continue": true })))
            }
            other => Err(FlowError::validation(format!(
                "'{}' is not a server-internal step",
                other.kind_name()
            ))),
        }
    }

    /// Build the emitted record and pending entry for a client-facing step.
    fn build_client_record(
        &self,
        step: &Step,
        scope: &Map<String, Value>,
    ) -> (StepRecord, PendingResult) {
        let mut pending = PendingResult {
            step: step.clone(),
            task_id: None,
            capture: Vec::new(),
            schema: None,
            state_path: None,
        };
        let definition = match &step.kind {
            StepKind::UserMessage { message } => {
                json!({ "message": expand_string(message, scope) })
            }
            StepKind::ShellCommand { command, capture } => {
                pending.capture = capture.clone();
                json!({
                    "command": expand_string(command, scope),
                    "capture": capture,
                })
            }
            StepKind::McpCall {
                tool,
                parameters,
                capture,
            } => {
                pending.capture = capture.clone();
                json!({
                    "tool": tool,
                    "parameters": expand_value(parameters, scope),
                    "capture": capture,
                })
            }
            StepKind::UserInput {
                prompt,
                schema,
                state_path,
            } => {
                pending.schema = schema.clone();
                pending.state_path = state_path.clone();
                json!({
                    "prompt": expand_string(prompt, scope),
                    "schema": schema,
                    "state_path": state_path,
                })
            }
            StepKind::AgentPrompt { prompt } => {
                json!({ "prompt": expand_string(prompt, scope) })
            }
            other => json!({ "type": other.kind_name() }),
        };
        (
            StepRecord {
                id: step.id.clone(),
                step_type: step.kind.kind_name().to_string(),
                definition,
                result: None,
            },
            pending,
        )
    }

    /// Emit a parent-queue client step: build the record, register the
    /// pending entry for result-bearing kinds, and arm its deadline.
    fn emit_client_step(
        &self,
        inst: &mut WorkflowInstance,
        step: &Step,
        scope: &Map<String, Value>,
    ) -> StepRecord {
        let (record, pending) = self.build_client_record(step, scope);
        if let Some(timeout_ms) = step.timeout_ms {
            let step_key = TimeoutManager::step_key(&inst.id, &step.id);
            self.timeouts
                .set_deadline(step_key.clone(), Duration::from_millis(timeout_ms));
            // cascade: a workflow deadline cancels this step's deadline
            self.timeouts.link(inst.id.clone(), step_key);
        }
        if accepts_result(&step.kind) {
            inst.pending.insert(step.id.clone(), pending);
        }
        record
    }

    // --- submitted results -------------------------------------------------

    /// Apply a client-submitted step result (success or reported failure).
    pub fn apply_step_result(
        &self,
        inst: &mut WorkflowInstance,
        step_id: &str,
        result: Value,
    ) -> Result<()> {
        let key = inst.find_pending_key(step_id).ok_or_else(|| {
            FlowError::not_found(format!("no pending step '{step_id}' in '{}'", inst.id))
        })?;
        let pending = inst.pending.remove(&key).expect("key just found");
        self.timeouts
            .cancel(&TimeoutManager::step_key(&inst.id, &key));
        inst.touch();

        // cancellation is cooperative: a result from a cancelled (or already
        // torn down) task arrives late and is discarded
        if let Some(task_id) = pending.task_id.as_deref() {
            let live = inst
                .parallel
                .as_ref()
                .and_then(|run| run.task(task_id))
                .map(|task| task.status != TaskStatus::Cancelled)
                .unwrap_or(false);
            if !live {
                debug!(workflow_id = %inst.id, task_id, "discarding result for cancelled task");
                return Ok(());
            }
        }

        if let Some(error_obj) = result.get("error") {
            let error_type = error_obj
                .get("type")
                .or_else(|| error_obj.get("code"))
                .and_then(Value::as_str)
                .unwrap_or("OPERATION_FAILED")
                .to_string();
            let message = error_obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("step failed")
                .to_string();
            return self.apply_reported_failure(inst, pending, error_type, message);
        }

        self.apply_successful_result(inst, pending, result)
    }

    fn apply_successful_result(
        &self,
        inst: &mut WorkflowInstance,
        pending: PendingResult,
        result: Value,
    ) -> Result<()> {
        let step_id = pending.step.id.clone();

        if let StepKind::UserInput { .. } = pending.step.kind {
            let value = result.get("value").cloned().unwrap_or(result);
            if let Some(schema) = &pending.schema {
                if let Err(message) = validate_against_schema(schema, &value) {
                    let err = FlowError::validation(message);
                    let record = ErrorRecord::from_flow_error(&err, &inst.id, Some(step_id));
                    return self
                        .resolve_reported_flow(inst, &pending, record, err)
                        .map(|_| ());
                }
            }
            if let Some(path) = &pending.state_path {
                self.store
                    .update(&inst.id, &[UpdateOp::set(path.clone(), value)])?;
            }
            self.handlers.record_success(&inst.id, &pending.step.id);
            return Ok(());
        }

        if !pending.capture.is_empty() {
            let task_bindings = self.task_bindings_for(inst, pending.task_id.as_deref());
            let mut scope = self.build_scope(&inst.id, None, task_bindings)?;
            scope.insert("result".to_string(), result);
            let ops = expand_update_ops(&pending.capture, &scope)?;
            let outcome = self.store.update(&inst.id, &ops)?;
            for err in outcome.computed_errors {
                let record = ErrorRecord::from_flow_error(&err, &inst.id, Some(step_id.clone()));
                self.tracker.track(record, Some("continue"));
            }
        }
        self.handlers.record_success(&inst.id, &pending.step.id);
        Ok(())
    }

    fn apply_reported_failure(
        &self,
        inst: &mut WorkflowInstance,
        pending: PendingResult,
        error_type: String,
        message: String,
    ) -> Result<()> {
        warn!(
            workflow_id = %inst.id,
            step_id = %pending.step.id,
            error_type = %error_type,
            "client reported step failure"
        );
        let record = ErrorRecord::from_client_report(
            error_type,
            message.clone(),
            &inst.id,
            Some(pending.step.id.clone()),
        );
        let err = FlowError::operation_failed(message);
        self.resolve_reported_flow(inst, &pending, record, err)
            .map(|_| ())
    }

    /// Resolve a reported failure through the handler. A terminal action
    /// fails the owning task or the workflow; the submit itself succeeds.
    fn resolve_reported_flow(
        &self,
        inst: &mut WorkflowInstance,
        pending: &PendingResult,
        record: ErrorRecord,
        err: FlowError,
    ) -> Result<bool> {
        let flow = self.dispatch_error(
            &inst.id,
            &pending.step,
            pending.task_id.as_deref(),
            record,
            &err,
        );
        match flow {
            Ok(ErrorFlow::Advance) => Ok(true),
            Ok(ErrorFlow::AdvanceWith(value)) => {
                // fallback value plays the part of the successful result;
                // the validator is skipped so a null fallback cannot loop
                let replacement = PendingResult {
                    schema: None,
                    ..pending.clone()
                };
                self.apply_successful_result(inst, replacement, value)?;
                Ok(true)
            }
            Ok(ErrorFlow::Backoff(delay)) => {
                self.requeue_pending(inst, pending, Some(delay));
                Ok(true)
            }
            Ok(ErrorFlow::Requeue) => {
                self.requeue_pending(inst, pending, None);
                Ok(true)
            }
            Err(terminal) => {
                match pending.task_id.as_deref() {
                    Some(task_id) => {
                        let inst_id = inst.id.clone();
                        if let Some(run) = inst.parallel.as_mut() {
                            self.fail_task(
                                &inst_id,
                                run,
                                task_id,
                                Some(&pending.step),
                                terminal,
                            );
                        }
                        self.settle_fan_in_failure(inst);
                    }
                    None => {
                        let record =
                            ErrorRecord::from_flow_error(&terminal, &inst.id, None);
                        self.tracker.track(record, Some("fail"));
                        inst.mark_failed(terminal);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Drop pending entries whose results were never submitted: parent-owned
    /// entries when `task_id` is `None`, otherwise the given task's.
    fn forfeit_pending(&self, inst: &mut WorkflowInstance, task_id: Option<&str>) {
        let stale: Vec<String> = inst
            .pending
            .iter()
            .filter(|(_, p)| p.task_id.as_deref() == task_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            debug!(workflow_id = %inst.id, key = %key, "forfeiting unsubmitted step result");
            inst.pending.remove(&key);
            self.timeouts
                .cancel(&TimeoutManager::step_key(&inst.id, &key));
        }
    }

    /// A pending step's deadline expired: funnel a timeout through its
    /// handler as if the client had reported one. Deadlines cancelled by the
    /// cascade are applied first, so descendants never fire on their own.
    pub fn apply_step_timeout(
        &self,
        inst: &mut WorkflowInstance,
        key: &str,
        cancelled_descendants: &[String],
    ) -> Result<()> {
        self.cancel_descendant_steps(inst, cancelled_descendants);

        // an expired parallel_foreach deadline fails the whole fan-out
        let parallel_expired = inst
            .parallel
            .as_ref()
            .map(|run| run.step_id == key)
            .unwrap_or(false);
        if parallel_expired {
            let err = FlowError::Timeout {
                message: format!("step '{key}' deadline exceeded"),
            };
            let record = ErrorRecord::from_flow_error(&err, &inst.id, Some(key.to_string()));
            self.tracker.track(record, Some("fail"));
            if let Some(run) = inst.parallel.as_mut() {
                run.cancel_remaining();
            }
            inst.mark_failed(err);
            return Ok(());
        }

        let Some(pending) = inst.pending.remove(key) else {
            return Ok(());
        };
        let err = FlowError::Timeout {
            message: format!("step '{}' deadline exceeded", pending.step.id),
        };
        let record = ErrorRecord::from_flow_error(&err, &inst.id, Some(pending.step.id.clone()));
        self.resolve_reported_flow(inst, &pending, record, err)
            .map(|_| ())
    }

    /// The workflow's deadline expired: cascade-cancelled step deadlines are
    /// settled, in-flight tasks are cancelled, and the workflow fails with
    /// TIMEOUT.
    pub fn apply_workflow_timeout(
        &self,
        inst: &mut WorkflowInstance,
        cancelled_descendants: &[String],
    ) {
        self.cancel_descendant_steps(inst, cancelled_descendants);
        let err = FlowError::Timeout {
            message: "workflow deadline exceeded".to_string(),
        };
        let record = ErrorRecord::from_flow_error(&err, &inst.id, None);
        self.tracker.track(record, Some("fail"));
        if let Some(run) = inst.parallel.as_mut() {
            run.cancel_remaining();
        }
        inst.mark_failed(err);
    }

    /// Cascade rule: a descendant whose deadline was cancelled by a parent
    /// expiry inherits CANCELLED — its pending entry is dropped and its
    /// owning task (if any) is cancelled rather than left to fire later.
    fn cancel_descendant_steps(&self, inst: &mut WorkflowInstance, descendant_keys: &[String]) {
        let prefix = format!("{}/", inst.id);
        for key in descendant_keys {
            let Some(pending_key) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(pending) = inst.pending.remove(pending_key) {
                debug!(
                    workflow_id = %inst.id,
                    step_id = %pending.step.id,
                    "step cancelled by cascading timeout"
                );
                if let Some(task_id) = pending.task_id.as_deref() {
                    if let Some(run) = inst.parallel.as_mut() {
                        if let Some(task) = run.task_mut(task_id) {
                            if !task.status.is_terminal() {
                                task.status = TaskStatus::Cancelled;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Put a step back at the front of its owning queue for re-dispatch.
    fn requeue_pending(
        &self,
        inst: &mut WorkflowInstance,
        pending: &PendingResult,
        delay: Option<Duration>,
    ) {
        match pending.task_id.as_deref() {
            Some(task_id) => {
                if let Some(run) = inst.parallel.as_mut() {
                    if let Some(task) = run.task_mut(task_id) {
                        task.queue.push_front_step(pending.step.clone());
                        task.backoff_until = delay.map(|d| Instant::now() + d);
                    }
                }
            }
            None => {
                inst.queue.push_front_step(pending.step.clone());
                inst.backoff_until = delay.map(|d| Instant::now() + d);
            }
        }
    }

    fn task_bindings_for(
        &self,
        inst: &WorkflowInstance,
        task_id: Option<&str>,
    ) -> Option<Map<String, Value>> {
        let task_id = task_id?;
        let run = inst.parallel.as_ref()?;
        let task = run.task(task_id)?;
        Some(task_scope_bindings(&task.context, &task.inputs))
    }

    // --- error dispatch ----------------------------------------------------

    /// Funnel a parent server-step error through its handler. `Err` means
    /// the workflow is now failed.
    fn handle_parent_error(
        &self,
        inst: &mut WorkflowInstance,
        step: &Step,
        err: FlowError,
    ) -> Result<ErrorFlow> {
        let record = ErrorRecord::from_flow_error(&err, &inst.id, Some(step.id.clone()));
        match self.dispatch_error(&inst.id, step, None, record, &err) {
            Ok(flow) => Ok(flow),
            Err(terminal) => {
                inst.mark_failed(terminal.clone());
                Err(terminal)
            }
        }
    }

    /// Shared error dispatch: strategy lookup, tracking, error_state_path
    /// write. `Err` carries the terminal error (fail or retry exhaustion).
    fn dispatch_error(
        &self,
        inst_id: &str,
        step: &Step,
        task_id: Option<&str>,
        mut record: ErrorRecord,
        err: &FlowError,
    ) -> Result<ErrorFlow> {
        let handler = effective_handler(step);
        record.retry_count = self.handlers.retry_attempts(inst_id, &step.id);
        if let Some(task) = task_id {
            record = record.with_context(ErrorContext {
                workflow_id: inst_id.to_string(),
                step_id: Some(step.id.clone()),
                task_id: Some(task.to_string()),
                execution_context: None,
            });
        }

        let action = self.handlers.handle_error(&record, &handler);
        let action_name = match &action {
            ErrorAction::Fail => "fail",
            ErrorAction::Continue => "continue",
            ErrorAction::Retry { .. } => "retry",
            ErrorAction::Fallback { .. } => "fallback",
            ErrorAction::CircuitRetry => "circuit_breaker",
        };

        if let Some(path) = &handler.error_state_path {
            let op = UpdateOp::set(path.clone(), record.to_json());
            if let Err(write_err) = self.store.update(inst_id, &[op]) {
                warn!(error = %write_err, "error_state_path write failed");
            }
        }
        self.tracker.track(record, Some(action_name));

        match action {
            ErrorAction::Fail => {
                let attempts = self.handlers.retry_attempts(inst_id, &step.id);
                if handler.strategy == ErrorStrategy::Retry && attempts > 0 {
                    Err(FlowError::RetryExhausted {
                        attempts,
                        message: err.to_string(),
                    })
                } else {
                    Err(err.clone())
                }
            }
            ErrorAction::Continue => Ok(ErrorFlow::Advance),
            ErrorAction::Retry { delay, .. } => Ok(ErrorFlow::Backoff(delay)),
            ErrorAction::Fallback { value } => Ok(ErrorFlow::AdvanceWith(value)),
            ErrorAction::CircuitRetry => Ok(ErrorFlow::Requeue),
        }
    }

    /// Expansion scope: state snapshot tiers + flattened view, task
    /// bindings, then loop bindings (innermost wins).
    fn build_scope(
        &self,
        inst_id: &str,
        loop_bindings: Option<Map<String, Value>>,
        task_bindings: Option<Map<String, Value>>,
    ) -> Result<Map<String, Value>> {
        let snapshot = self.store.read(inst_id)?;
        let mut scope = snapshot.scope();
        if let Some(bindings) = task_bindings {
            for (k, v) in bindings {
                scope.insert(k, v);
            }
        }
        if let Some(bindings) = loop_bindings {
            for (k, v) in bindings {
                scope.insert(k, v);
            }
        }
        Ok(scope)
    }
}

/// The effective handler for a step: its override or the per-type default.
pub fn effective_handler(step: &Step) -> ErrorHandler {
    step.on_error
        .clone()
        .unwrap_or_else(|| default_handler_for(step.kind.kind_name()))
}

/// Whether emitting this step closes the current batch.
pub fn closes_batch(kind: &StepKind) -> bool {
    match kind {
        StepKind::UserMessage { .. } => false,
        // a captured result can feed later templates, so the round-trip must
        // happen before anything after it runs
        StepKind::ShellCommand { capture, .. } | StepKind::McpCall { capture, .. } => {
            !capture.is_empty()
        }
        StepKind::UserInput { .. }
        | StepKind::AgentPrompt { .. }
        | StepKind::ParallelForeach { .. } => true,
        _ => false,
    }
}

/// Client kinds that can report a result back.
fn accepts_result(kind: &StepKind) -> bool {
    matches!(
        kind,
        StepKind::ShellCommand { .. }
            | StepKind::McpCall { .. }
            | StepKind::UserInput { .. }
            | StepKind::AgentPrompt { .. }
    )
}

/// Expand the path and value of each update operation against the scope.
pub fn expand_update_ops(ops: &[UpdateOp], scope: &Map<String, Value>) -> Result<Vec<UpdateOp>> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        let path = match expand_string(&op.path, scope) {
            Value::String(s) => s,
            other => {
                return Err(FlowError::invalid_path(format!(
                    "path template produced {other}"
                )))
            }
        };
        out.push(UpdateOp {
            path,
            value: expand_value(&op.value, scope),
            operation: op.operation,
        });
    }
    Ok(out)
}

/// Validate a user_input response against its JSON schema.
fn validate_against_schema(schema: &Value, value: &Value) -> std::result::Result<(), String> {
    if !schema.is_object() {
        return Ok(());
    }
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid response schema: {e}"))?;
    if validator.validate(value).is_err() {
        let messages: Vec<String> = validator
            .iter_errors(value)
            .take(3)
            .map(|e| e.to_string())
            .collect();
        return Err(messages.join("; "));
    }
    Ok(())
}

/// Bindings a sub-agent task contributes to expansion: bare item/index/
/// total, the task inputs merged over the parent's, and a task object.
pub fn task_scope_bindings(
    context: &TaskContext,
    inputs: &Map<String, Value>,
) -> Map<String, Value> {
    let mut bindings = Map::new();
    bindings.insert("item".to_string(), context.item.clone());
    bindings.insert("index".to_string(), Value::from(context.index as i64));
    bindings.insert("total".to_string(), Value::from(context.total as i64));
    bindings.insert(
        "task".to_string(),
        json!({
            "workflow_id": context.workflow_id,
            "index": context.index,
            "inputs": inputs,
        }),
    );
    if !inputs.is_empty() {
        bindings.insert("inputs".to_string(), Value::Object(inputs.clone()));
    }
    bindings
}
