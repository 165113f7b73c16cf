// ABOUTME: Computed-field dependency graph: topological ordering and reactivity
// ABOUTME: Built once at workflow load; cycles are fatal load errors

use crate::path::{get_at, PathSegment, StatePath, Tier};
use flowspell_core::{ComputedFieldDef, FlowError, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

/// Dependency graph over a definition's computed fields.
///
/// Holds the parsed source paths and a topological evaluation order so a
/// transaction can re-evaluate exactly the impacted fields, dependencies
/// first.
#[derive(Debug, Clone)]
pub struct ComputedGraph {
    fields: BTreeMap<String, ComputedFieldDef>,
    sources: BTreeMap<String, Vec<StatePath>>,
    topo: Vec<String>,
}

impl ComputedGraph {
    /// Build the graph, validating source paths and rejecting cycles.
    pub fn build(defs: &BTreeMap<String, ComputedFieldDef>) -> Result<Self> {
        let mut sources = BTreeMap::new();
        for (name, def) in defs {
            let mut parsed = Vec::new();
            for raw in def.from.paths() {
                let path = StatePath::parse(raw).map_err(|e| {
                    FlowError::validation(format!("computed field '{name}': {e}"))
                })?;
                parsed.push(path);
            }
            sources.insert(name.clone(), parsed);
        }

        // Edges between computed fields determine evaluation order.
        let mut in_degree: BTreeMap<&str, usize> =
            defs.keys().map(|k| (k.as_str(), 0)).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, paths) in &sources {
            for path in paths {
                if path.tier != Tier::Computed {
                    continue;
                }
                let Some(PathSegment::Key(dep)) = path.segments.first() else {
                    continue;
                };
                if !defs.contains_key(dep) {
                    return Err(FlowError::validation(format!(
                        "computed field '{name}' references unknown computed field '{dep}'"
                    )));
                }
                *in_degree.get_mut(name.as_str()).expect("field present") += 1;
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut topo = Vec::with_capacity(defs.len());
        while let Some(name) = queue.pop_front() {
            topo.push(name.to_string());
            for dep in dependents.get(name).into_iter().flatten() {
                let d = in_degree.get_mut(dep).expect("field present");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dep);
                }
            }
        }
        if topo.len() != defs.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(k, _)| *k)
                .collect();
            return Err(FlowError::validation(format!(
                "computed field dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self {
            fields: defs.clone(),
            sources,
            topo,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in dependency order.
    pub fn topo_order(&self) -> &[String] {
        &self.topo
    }

    /// Fields whose transitive sources intersect the written paths, in
    /// dependency order. A changed computed field dirties its own path so
    /// downstream fields cascade.
    pub fn impacted(&self, written: &[StatePath]) -> Vec<String> {
        let mut dirty: Vec<StatePath> = written.to_vec();
        let mut impacted = Vec::new();
        for name in &self.topo {
            let sources = &self.sources[name];
            let hit = sources
                .iter()
                .any(|src| dirty.iter().any(|w| src.overlaps(w)));
            if hit {
                dirty.push(StatePath {
                    tier: Tier::Computed,
                    segments: vec![PathSegment::Key(name.clone())],
                });
                impacted.push(name.clone());
            }
        }
        impacted
    }

    /// Evaluate one field against the given tiers. The caller writes the
    /// result (or null on error) into the computed tier.
    pub fn evaluate_field(
        &self,
        name: &str,
        inputs: &Map<String, Value>,
        state: &Map<String, Value>,
        computed: &Map<String, Value>,
    ) -> Result<Value> {
        let def = self.fields.get(name).ok_or_else(|| {
            FlowError::not_found(format!("computed field '{name}'"))
        })?;
        let paths = &self.sources[name];

        let resolve = |path: &StatePath| -> Value {
            let root = match path.tier {
                Tier::Inputs => inputs,
                Tier::State => state,
                Tier::Computed => computed,
            };
            get_at(root, &path.segments).cloned().unwrap_or(Value::Null)
        };

        let input = if def.from.is_list() {
            Value::Array(paths.iter().map(resolve).collect())
        } else {
            resolve(&paths[0])
        };

        let mut scope = Map::new();
        scope.insert("input".to_string(), input);
        scope.insert("inputs".to_string(), Value::Object(inputs.clone()));
        scope.insert("state".to_string(), Value::Object(state.clone()));
        scope.insert("computed".to_string(), Value::Object(computed.clone()));

        flowspell_expr::evaluate(&def.transform, &scope).map_err(|e| FlowError::ComputedField {
            field: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Re-evaluate the given fields in place, collecting evaluation errors.
    /// A failed field takes the value null.
    pub fn evaluate_into(
        &self,
        names: &[String],
        inputs: &Map<String, Value>,
        state: &Map<String, Value>,
        computed: &mut Map<String, Value>,
    ) -> Vec<FlowError> {
        let mut errors = Vec::new();
        for name in names {
            match self.evaluate_field(name, inputs, state, computed) {
                Ok(value) => {
                    computed.insert(name.clone(), value);
                }
                Err(err) => {
                    warn!(field = %name, error = %err, "computed field evaluation failed");
                    computed.insert(name.clone(), Value::Null);
                    errors.push(err);
                }
            }
        }
        errors
    }
}
