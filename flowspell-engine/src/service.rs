// ABOUTME: WorkflowService: the RPC surface of the engine
// ABOUTME: start / get_next_step / sub-agent steps / submit results / status

use crate::config::EngineConfig;
use crate::errors::handlers::HandlerRegistry;
use crate::errors::tracking::ErrorTracker;
use crate::executor::{Executor, ParentAdvance, TaskAdvance};
use crate::instance::WorkflowInstance;
use crate::responses::{
    Progress, StartResponse, StatusResponse, StepBatch, SubAgentStepResponse, SubmitResponse,
    WorkflowSummary,
};
use crate::timeout::TimeoutManager;
use dashmap::DashMap;
use flowspell_core::{
    new_workflow_id, ErrorHandler, FlowError, Result, WorkflowDefinition, WorkflowStatus,
};
use flowspell_state::{ComputedGraph, StateStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

type SharedInstance = Arc<Mutex<WorkflowInstance>>;

/// The engine facade. One instance serves every workflow in the process;
/// all state is in memory.
pub struct WorkflowService {
    config: EngineConfig,
    store: Arc<StateStore>,
    handlers: Arc<HandlerRegistry>,
    tracker: Arc<ErrorTracker>,
    timeouts: Arc<TimeoutManager>,
    executor: Executor,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    instances: DashMap<String, SharedInstance>,
}

impl Default for WorkflowService {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowService {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(StateStore::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let tracker = Arc::new(ErrorTracker::new(
            config.max_errors_per_workflow,
            config.max_global_errors,
        ));
        let timeouts = Arc::new(TimeoutManager::new());
        let executor = Executor {
            store: store.clone(),
            handlers: handlers.clone(),
            tracker: tracker.clone(),
            timeouts: timeouts.clone(),
        };
        Self {
            config,
            store,
            handlers,
            tracker,
            timeouts,
            executor,
            definitions: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// Load a definition. Validation failures (including computed-field
    /// cycles) are fatal here, before any workflow can start from it.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        ComputedGraph::build(&definition.computed)?;
        info!(name = %definition.name, "workflow definition registered");
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Start a workflow: freeze inputs, seed state, evaluate computed
    /// fields, and queue the steps.
    #[instrument(skip_all, fields(workflow = %name))]
    pub fn start(&self, name: &str, inputs: BTreeMap<String, Value>) -> Result<StartResponse> {
        let definition = self
            .definitions
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| FlowError::not_found(format!("workflow definition '{name}'")))?;

        let resolved = definition.resolve_inputs(&inputs)?;
        let workflow_id = new_workflow_id();
        let outcome = self.store.initialise(
            &workflow_id,
            &definition.computed,
            &definition.default_state,
            resolved,
        )?;
        for err in outcome.computed_errors {
            let record = crate::errors::models::ErrorRecord::from_flow_error(
                &err,
                &workflow_id,
                None,
            );
            self.tracker.track(record, Some("continue"));
        }

        let instance = WorkflowInstance::new(workflow_id.clone(), definition);
        let total_steps = instance.total_steps;
        if let Some(timeout) = self.config.default_workflow_timeout {
            self.timeouts.set_deadline(&workflow_id, timeout);
        }
        self.instances
            .insert(workflow_id.clone(), Arc::new(Mutex::new(instance)));
        info!(workflow_id = %workflow_id, total_steps, "workflow started");

        Ok(StartResponse {
            workflow_id,
            status: WorkflowStatus::Running,
            state: outcome.snapshot,
            total_steps,
        })
    }

    /// Pull the next batch for the parent workflow. Returns `None` once the
    /// workflow has completed; a failed workflow returns its terminal error
    /// on every call.
    pub async fn get_next_step(&self, workflow_id: &str) -> Result<Option<StepBatch>> {
        loop {
            self.process_timeouts().await;
            let entry = self.instance(workflow_id)?;
            let advance = {
                let mut inst = entry.lock().await;
                match inst.status {
                    WorkflowStatus::Failed => {
                        return Err(inst
                            .terminal_error
                            .clone()
                            .unwrap_or_else(|| FlowError::operation_failed("workflow failed")));
                    }
                    WorkflowStatus::Completed => return Ok(None),
                    _ => {}
                }
                inst.touch();
                self.executor.advance_parent(&mut inst)?
            };
            match advance {
                ParentAdvance::Batch(batch) => return Ok(Some(batch)),
                ParentAdvance::Finished => return Ok(None),
                ParentAdvance::Sleep(delay) => {
                    // backoff suspension: no CPU work happens while waiting
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Pull the next step for one sub-agent task. `None` means the task has
    /// no further steps.
    pub async fn get_next_sub_agent_step(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<SubAgentStepResponse>> {
        loop {
            self.process_timeouts().await;
            let entry = self.instance(workflow_id)?;
            let advance = {
                let mut inst = entry.lock().await;
                inst.touch();
                self.executor.advance_task(&mut inst, task_id)?
            };
            match advance {
                TaskAdvance::Step(record) => {
                    return Ok(Some(SubAgentStepResponse::Step { step: record }))
                }
                TaskAdvance::Cancelled => return Ok(Some(SubAgentStepResponse::cancelled())),
                TaskAdvance::Waiting => return Ok(Some(SubAgentStepResponse::waiting())),
                TaskAdvance::Done => return Ok(None),
                TaskAdvance::Sleep(delay) => {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Deliver the result of a previously returned client step.
    pub async fn submit_step_result(
        &self,
        workflow_id: &str,
        step_id: &str,
        result: Value,
    ) -> Result<SubmitResponse> {
        self.process_timeouts().await;
        let entry = self.instance(workflow_id)?;
        let mut inst = entry.lock().await;
        self.executor.apply_step_result(&mut inst, step_id, result)?;
        Ok(SubmitResponse { applied: true })
    }

    pub async fn status(&self, workflow_id: &str) -> Result<StatusResponse> {
        let entry = self.instance(workflow_id)?;
        let inst = entry.lock().await;
        let state = self.store.read(workflow_id)?;
        Ok(StatusResponse {
            workflow_id: workflow_id.to_string(),
            status: inst.status,
            state,
            progress: Progress {
                steps_executed: inst.steps_executed,
                total_steps: inst.total_steps,
            },
        })
    }

    pub async fn list(&self) -> Vec<WorkflowSummary> {
        let mut out = Vec::new();
        let entries: Vec<SharedInstance> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let inst = entry.lock().await;
            out.push(WorkflowSummary {
                workflow_id: inst.id.clone(),
                name: inst.definition.name.clone(),
                status: inst.status,
                steps_executed: inst.steps_executed,
            });
        }
        out.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        out
    }

    // --- error layer surface ----------------------------------------------

    pub fn register_error_handler(&self, name: impl Into<String>, handler: ErrorHandler) {
        self.handlers.register_named(name, handler);
    }

    pub fn error_summary(&self, workflow_id: Option<&str>) -> Value {
        self.tracker.history.summary(workflow_id)
    }

    pub fn error_export(&self, workflow_id: Option<&str>, format: &str) -> Result<String> {
        self.tracker
            .export(workflow_id, format)
            .ok_or_else(|| FlowError::invalid_input(format!("unsupported format '{format}'")))
    }

    pub fn error_patterns(&self) -> Vec<crate::errors::tracking::ErrorPattern> {
        self.tracker.detect_patterns()
    }

    pub fn recovery_stats(&self) -> Value {
        self.tracker.recovery_stats()
    }

    pub fn recent_errors(&self, hours: i64) -> Vec<crate::errors::models::ErrorRecord> {
        self.tracker.history.recent(chrono::Duration::hours(hours))
    }

    pub fn top_errors(&self, limit: usize, hours: i64) -> Vec<Value> {
        self.tracker.top_errors(limit, chrono::Duration::hours(hours))
    }

    pub fn handler_stats(&self) -> Value {
        self.handlers.stats()
    }

    /// Register a cleanup callback fired synchronously when the workflow's
    /// deadline expires, before the workflow is marked failed.
    pub fn on_workflow_timeout(
        &self,
        workflow_id: &str,
        cleanup: Box<dyn FnOnce() + Send>,
    ) {
        self.timeouts.on_expire(workflow_id, cleanup);
    }

    /// Arm or replace the deadline for a running workflow.
    pub fn set_workflow_timeout(&self, workflow_id: &str, timeout: std::time::Duration) {
        self.timeouts.set_deadline(workflow_id, timeout);
    }

    // --- housekeeping ------------------------------------------------------

    /// Process expired deadlines: a workflow key fails the workflow with
    /// TIMEOUT; a step key funnels a timeout through the step's handler.
    async fn process_timeouts(&self) {
        for expiry in self.timeouts.sweep() {
            match expiry.key.split_once('/') {
                None => {
                    // workflow deadline; clone the handle so no map guard is
                    // held across the await
                    let entry = self.instances.get(&expiry.key).map(|e| e.value().clone());
                    if let Some(entry) = entry {
                        let mut inst = entry.lock().await;
                        self.executor
                            .apply_workflow_timeout(&mut inst, &expiry.cancelled_descendants);
                    }
                }
                Some((workflow_id, pending_key)) => {
                    let entry = self.instances.get(workflow_id).map(|e| e.value().clone());
                    if let Some(entry) = entry {
                        let mut inst = entry.lock().await;
                        if let Err(err) = self.executor.apply_step_timeout(
                            &mut inst,
                            pending_key,
                            &expiry.cancelled_descendants,
                        ) {
                            warn!(key = %expiry.key, error = %err, "step timeout handling failed");
                        }
                    }
                }
            }
        }
    }

    /// Drop terminal instances past their linger and idle instances past
    /// the inactivity TTL, together with their state and bookkeeping.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for id in ids {
            let Some(entry) = self.instances.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let expired = {
                let inst = entry.lock().await;
                match inst.terminal_at {
                    Some(at) => now.duration_since(at) >= self.config.terminal_linger,
                    None => {
                        now.duration_since(inst.last_activity) >= self.config.inactivity_ttl
                    }
                }
            };
            if expired {
                self.remove_workflow(&id);
                removed += 1;
            }
        }
        removed
    }

    fn remove_workflow(&self, workflow_id: &str) {
        info!(workflow_id, "dropping workflow instance");
        self.instances.remove(workflow_id);
        self.store.delete(workflow_id);
        self.handlers.purge_workflow(workflow_id);
        self.tracker.purge_workflow(workflow_id);
        self.timeouts.purge_workflow(workflow_id);
    }

    fn instance(&self, workflow_id: &str) -> Result<SharedInstance> {
        self.instances
            .get(workflow_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FlowError::not_found(format!("workflow '{workflow_id}'")))
    }
}
