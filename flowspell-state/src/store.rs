// ABOUTME: In-memory three-tier state store with transactional updates
// ABOUTME: Per-workflow serialisation; readers see pre- or post-state only

use crate::computed::ComputedGraph;
use crate::path::{get_at, StatePath, Tier};
use dashmap::DashMap;
use flowspell_core::{ComputedFieldDef, FlowError, Result, UpdateOp};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A consistent view of one workflow's three tiers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSnapshot {
    pub inputs: Map<String, Value>,
    pub state: Map<String, Value>,
    pub computed: Map<String, Value>,
}

impl StateSnapshot {
    /// Single-namespace view for template expansion: `computed` overrides
    /// `state` overrides `inputs` on name collision. The tiers themselves
    /// are never mutated to produce this.
    pub fn flattened(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (k, v) in &self.inputs {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.state {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.computed {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Expansion scope: the flattened view plus the tiers as addressable
    /// objects, so both `counter` and `state.counter` resolve.
    pub fn scope(&self) -> Map<String, Value> {
        let mut out = self.flattened();
        out.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        out.insert("state".to_string(), Value::Object(self.state.clone()));
        out.insert("computed".to_string(), Value::Object(self.computed.clone()));
        out
    }

    /// Resolve one parsed path against the snapshot.
    pub fn resolve(&self, path: &StatePath) -> Option<&Value> {
        let root = match path.tier {
            Tier::Inputs => &self.inputs,
            Tier::State => &self.state,
            Tier::Computed => &self.computed,
        };
        get_at(root, &path.segments)
    }
}

/// Result of a transactional update: the published snapshot plus any
/// computed-field evaluation failures (the fields took the value null).
#[derive(Debug)]
pub struct UpdateOutcome {
    pub snapshot: StateSnapshot,
    pub computed_errors: Vec<FlowError>,
}

struct WorkflowState {
    snapshot: StateSnapshot,
    graph: ComputedGraph,
}

/// Process-wide store of per-workflow state. Operations on one workflow are
/// serialised by its lock; different workflows proceed independently.
#[derive(Default)]
pub struct StateStore {
    states: DashMap<String, Arc<RwLock<WorkflowState>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialise a workflow's state: inputs are frozen, the state tier is
    /// seeded from defaults, and every computed field is evaluated once.
    pub fn initialise(
        &self,
        workflow_id: &str,
        computed_defs: &BTreeMap<String, ComputedFieldDef>,
        default_state: &BTreeMap<String, Value>,
        inputs: BTreeMap<String, Value>,
    ) -> Result<UpdateOutcome> {
        let graph = ComputedGraph::build(computed_defs)?;

        let mut snapshot = StateSnapshot::default();
        for (k, v) in inputs {
            snapshot.inputs.insert(k, v);
        }
        for (k, v) in default_state {
            snapshot.state.insert(k.clone(), v.clone());
        }

        let order: Vec<String> = graph.topo_order().to_vec();
        let computed_errors = graph.evaluate_into(
            &order,
            &snapshot.inputs,
            &snapshot.state,
            &mut snapshot.computed,
        );

        let entry = Arc::new(RwLock::new(WorkflowState {
            snapshot: snapshot.clone(),
            graph,
        }));
        self.states.insert(workflow_id.to_string(), entry);
        debug!(workflow_id, "state initialised");
        Ok(UpdateOutcome {
            snapshot,
            computed_errors,
        })
    }

    /// Apply update operations atomically. All operations apply in listed
    /// order, impacted computed fields re-evaluate in dependency order, and
    /// the new snapshot is published; on any operation error nothing is
    /// committed.
    pub fn update(&self, workflow_id: &str, ops: &[UpdateOp]) -> Result<UpdateOutcome> {
        let entry = self.entry(workflow_id)?;
        let mut guard = entry.write();

        let mut written = Vec::with_capacity(ops.len());
        let mut state = guard.snapshot.state.clone();
        for op in ops {
            let path = StatePath::parse_writable(&op.path)?;
            crate::path::apply_at(&mut state, &path.segments, op.value.clone(), op.operation)?;
            written.push(path);
        }

        let impacted = guard.graph.impacted(&written);
        let mut computed = guard.snapshot.computed.clone();
        let computed_errors = guard.graph.evaluate_into(
            &impacted,
            &guard.snapshot.inputs,
            &state,
            &mut computed,
        );

        guard.snapshot.state = state;
        guard.snapshot.computed = computed;
        let snapshot = guard.snapshot.clone();
        Ok(UpdateOutcome {
            snapshot,
            computed_errors,
        })
    }

    /// Read the current consistent snapshot.
    pub fn read(&self, workflow_id: &str) -> Result<StateSnapshot> {
        let entry = self.entry(workflow_id)?;
        let guard = entry.read();
        Ok(guard.snapshot.clone())
    }

    /// Read specific paths: canonical path -> value (null when absent).
    pub fn read_paths(&self, workflow_id: &str, paths: &[String]) -> Result<Map<String, Value>> {
        let snapshot = self.read(workflow_id)?;
        let mut out = Map::new();
        for raw in paths {
            let path = StatePath::parse(raw)?;
            let value = snapshot.resolve(&path).cloned().unwrap_or(Value::Null);
            out.insert(path.canonical(), value);
        }
        Ok(out)
    }

    /// The flattened single-namespace view.
    pub fn flattened_view(&self, workflow_id: &str) -> Result<Map<String, Value>> {
        Ok(self.read(workflow_id)?.flattened())
    }

    pub fn delete(&self, workflow_id: &str) {
        self.states.remove(workflow_id);
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.states.contains_key(workflow_id)
    }

    fn entry(&self, workflow_id: &str) -> Result<Arc<RwLock<WorkflowState>>> {
        self.states
            .get(workflow_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FlowError::not_found(format!("workflow '{workflow_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_counter() -> (StateStore, String) {
        let store = StateStore::new();
        let mut computed = BTreeMap::new();
        computed.insert(
            "doubled".to_string(),
            ComputedFieldDef::single("state.counter", "input * 2"),
        );
        let mut defaults = BTreeMap::new();
        defaults.insert("counter".to_string(), json!(0));
        let mut inputs = BTreeMap::new();
        inputs.insert("name".to_string(), json!("T"));
        store
            .initialise("wf_test", &computed, &defaults, inputs)
            .unwrap();
        (store, "wf_test".to_string())
    }

    #[test]
    fn initialise_seeds_defaults_and_computed() {
        let (store, id) = store_with_counter();
        let snapshot = store.read(&id).unwrap();
        assert_eq!(snapshot.state["counter"], json!(0));
        assert_eq!(snapshot.computed["doubled"], json!(0));
        assert_eq!(snapshot.inputs["name"], json!("T"));
    }

    #[test]
    fn update_publishes_consistent_computed_fields() {
        let (store, id) = store_with_counter();
        let outcome = store
            .update(&id, &[UpdateOp::set("state.counter", json!(5))])
            .unwrap();
        assert_eq!(outcome.snapshot.state["counter"], json!(5));
        assert_eq!(outcome.snapshot.computed["doubled"], json!(10));
        assert!(outcome.computed_errors.is_empty());
    }

    #[test]
    fn update_rejects_immutable_tiers() {
        let (store, id) = store_with_counter();
        let err = store
            .update(&id, &[UpdateOp::set("inputs.name", json!("X"))])
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
        let err = store
            .update(&id, &[UpdateOp::set("computed.doubled", json!(99))])
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
        // nothing was committed
        let snapshot = store.read(&id).unwrap();
        assert_eq!(snapshot.inputs["name"], json!("T"));
        assert_eq!(snapshot.computed["doubled"], json!(0));
    }

    #[test]
    fn failed_transaction_commits_nothing() {
        let (store, id) = store_with_counter();
        let err = store
            .update(
                &id,
                &[
                    UpdateOp::set("state.counter", json!(9)),
                    UpdateOp::increment("state.counter", json!("not a number")),
                ],
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let snapshot = store.read(&id).unwrap();
        assert_eq!(snapshot.state["counter"], json!(0));
    }

    #[test]
    fn append_reactivity_is_atomic() {
        let store = StateStore::new();
        let mut computed = BTreeMap::new();
        computed.insert(
            "count".to_string(),
            ComputedFieldDef::single("state.items", "input.length"),
        );
        let mut defaults = BTreeMap::new();
        defaults.insert("items".to_string(), json!([]));
        store
            .initialise("wf_items", &computed, &defaults, BTreeMap::new())
            .unwrap();

        let outcome = store
            .update("wf_items", &[UpdateOp::append("state.items", json!("x"))])
            .unwrap();
        assert_eq!(outcome.snapshot.state["items"], json!(["x"]));
        assert_eq!(outcome.snapshot.computed["count"], json!(1));
    }

    #[test]
    fn flattened_precedence_computed_over_state_over_inputs() {
        let store = StateStore::new();
        let mut computed = BTreeMap::new();
        computed.insert(
            "shared".to_string(),
            ComputedFieldDef::single("state.shared", "'computed'"),
        );
        let mut defaults = BTreeMap::new();
        defaults.insert("shared".to_string(), json!("state"));
        let mut inputs = BTreeMap::new();
        inputs.insert("shared".to_string(), json!("inputs"));
        store
            .initialise("wf_flat", &computed, &defaults, inputs)
            .unwrap();
        let flat = store.flattened_view("wf_flat").unwrap();
        assert_eq!(flat["shared"], json!("computed"));
    }

    #[test]
    fn missing_workflow_is_not_found() {
        let store = StateStore::new();
        assert_eq!(store.read("wf_nope").unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn read_paths_resolves_each_tier() {
        let (store, id) = store_with_counter();
        let map = store
            .read_paths(
                &id,
                &[
                    "inputs.name".to_string(),
                    "state.counter".to_string(),
                    "computed.doubled".to_string(),
                    "state.absent".to_string(),
                ],
            )
            .unwrap();
        assert_eq!(map["inputs.name"], json!("T"));
        assert_eq!(map["state.counter"], json!(0));
        assert_eq!(map["computed.doubled"], json!(0));
        assert_eq!(map["state.absent"], Value::Null);
    }
}
