// ABOUTME: Workflow definition model: inputs, default state, computed schema, steps
// ABOUTME: Owned by an external loader; the engine consumes already-deserialized values

use crate::error::{FlowError, Result};
use crate::step::{FanInPolicy, Step, StepKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// A declarative workflow definition.
///
/// The engine never parses documents itself; a loader deserializes into this
/// type and hands it over. `validate` is called once at workflow start and
/// failures are fatal load errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Declared inputs: name -> declaration.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDecl>,
    /// Initial values for the mutable `state` tier.
    #[serde(default)]
    pub default_state: BTreeMap<String, Value>,
    /// Computed field declarations: name -> sources + transform.
    #[serde(default)]
    pub computed: BTreeMap<String, ComputedFieldDef>,
    pub steps: Vec<Step>,
    /// Task templates referenced by parallel_foreach steps.
    #[serde(default)]
    pub sub_agent_tasks: BTreeMap<String, SubAgentTaskDef>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: String::new(),
            inputs: BTreeMap::new(),
            default_state: BTreeMap::new(),
            computed: BTreeMap::new(),
            steps,
            sub_agent_tasks: BTreeMap::new(),
        }
    }

    /// Structural validation, performed at workflow load.
    ///
    /// Computed-field cycle detection happens when the dependency graph is
    /// built, alongside this.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FlowError::invalid_input("workflow name must not be empty"));
        }
        let mut seen = HashSet::new();
        validate_steps(&self.steps, self, &mut seen)?;
        for (task_name, task) in &self.sub_agent_tasks {
            let mut task_seen = HashSet::new();
            validate_steps(&task.steps, self, &mut task_seen).map_err(|e| {
                FlowError::invalid_input(format!("sub-agent task '{task_name}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Merge caller inputs over declared defaults, rejecting unknown or
    /// missing-required names.
    pub fn resolve_inputs(&self, provided: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        for name in provided.keys() {
            if !self.inputs.contains_key(name) {
                return Err(FlowError::invalid_input(format!(
                    "unknown input '{name}'"
                )));
            }
        }
        let mut resolved = BTreeMap::new();
        for (name, decl) in &self.inputs {
            match provided.get(name) {
                Some(value) => {
                    decl.check_type(name, value)?;
                    resolved.insert(name.clone(), value.clone());
                }
                None => match &decl.default {
                    Some(default) => {
                        resolved.insert(name.clone(), default.clone());
                    }
                    None if decl.required => {
                        return Err(FlowError::invalid_input(format!(
                            "missing required input '{name}'"
                        )));
                    }
                    None => {}
                },
            }
        }
        Ok(resolved)
    }
}

fn validate_steps(
    steps: &[Step],
    definition: &WorkflowDefinition,
    seen_ids: &mut HashSet<String>,
) -> Result<()> {
    for step in steps {
        if step.id.is_empty() {
            return Err(FlowError::invalid_input("step id must not be empty"));
        }
        if !seen_ids.insert(step.id.clone()) {
            return Err(FlowError::invalid_input(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        match &step.kind {
            StepKind::WhileLoop {
                max_iterations,
                body,
                ..
            } => {
                if *max_iterations == 0 {
                    return Err(FlowError::invalid_input(format!(
                        "step '{}': max_iterations must be positive",
                        step.id
                    )));
                }
                validate_steps(body, definition, seen_ids)?;
            }
            StepKind::Foreach { body, .. } => {
                validate_steps(body, definition, seen_ids)?;
            }
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                validate_steps(then_steps, definition, seen_ids)?;
                validate_steps(else_steps, definition, seen_ids)?;
            }
            StepKind::ParallelForeach {
                max_parallel,
                sub_agent_task,
                fan_in,
                ..
            } => {
                if *max_parallel == 0 {
                    return Err(FlowError::invalid_input(format!(
                        "step '{}': max_parallel must be positive",
                        step.id
                    )));
                }
                if !definition.sub_agent_tasks.contains_key(sub_agent_task) {
                    return Err(FlowError::invalid_input(format!(
                        "step '{}': unknown sub_agent_task '{sub_agent_task}'",
                        step.id
                    )));
                }
                if let FanInPolicy::Threshold { ratio } = fan_in {
                    if !(0.0..=1.0).contains(ratio) {
                        return Err(FlowError::invalid_input(format!(
                            "step '{}': threshold ratio must be within [0, 1]",
                            step.id
                        )));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Declaration of a single workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl Default for InputDecl {
    fn default() -> Self {
        Self {
            value_type: ValueType::Any,
            description: String::new(),
            required: true,
            default: None,
        }
    }
}

impl InputDecl {
    pub fn optional_with_default(value_type: ValueType, default: Value) -> Self {
        Self {
            value_type,
            description: String::new(),
            required: false,
            default: Some(default),
        }
    }

    fn check_type(&self, name: &str, value: &Value) -> Result<()> {
        let ok = match self.value_type {
            ValueType::Any => true,
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
        };
        if ok {
            Ok(())
        } else {
            Err(FlowError::invalid_input(format!(
                "input '{name}' expected {:?}",
                self.value_type
            )))
        }
    }
}

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// Declaration of a computed field: source path(s) plus a transform
/// expression over `input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedFieldDef {
    pub from: ComputedSources,
    pub transform: String,
}

impl ComputedFieldDef {
    pub fn single(from: impl Into<String>, transform: impl Into<String>) -> Self {
        Self {
            from: ComputedSources::One(from.into()),
            transform: transform.into(),
        }
    }

    pub fn multi(from: Vec<String>, transform: impl Into<String>) -> Self {
        Self {
            from: ComputedSources::Many(from),
            transform: transform.into(),
        }
    }
}

/// One source path or a list of them; with a list, `input` binds to the list
/// of source values in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComputedSources {
    One(String),
    Many(Vec<String>),
}

impl ComputedSources {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::One(p) => vec![p.as_str()],
            Self::Many(ps) => ps.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::Many(_))
    }
}

/// Template for sub-agent tasks spawned by parallel_foreach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTaskDef {
    #[serde(default)]
    pub description: String,
    /// Per-task inputs, expanded against the parent state at fan-out. Values
    /// may contain `{{ … }}` templates referencing `item`/`index`/`total`.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    pub steps: Vec<Step>,
}
