// ABOUTME: Control-flow step semantics: conditionals, while, foreach,
// ABOUTME: break/continue, and loop-frame continuation

use crate::queue::{FrameKind, StepQueue};
use flowspell_core::{FlowError, Result, Step};
use flowspell_expr::{expand_string, truthy};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Evaluate a condition against the expansion scope. Both raw expressions
/// (`counter < 10`) and templated forms (`{{ counter < 10 }}`) are accepted.
pub fn eval_condition(condition: &str, scope: &Map<String, Value>) -> Result<bool> {
    let value = if condition.contains("{{") {
        expand_string(condition, scope)
    } else {
        flowspell_expr::evaluate(condition, scope).map_err(|e| FlowError::ConditionEval {
            message: format!("'{condition}': {e}"),
        })?
    };
    Ok(truthy(&value))
}

/// Resolve an `items` expression to a concrete sequence, evaluated once.
pub fn eval_items(items: &str, scope: &Map<String, Value>) -> Result<Vec<Value>> {
    let value = if items.contains("{{") {
        expand_string(items, scope)
    } else {
        flowspell_expr::evaluate(items, scope).map_err(|e| FlowError::NonIterable {
            message: format!("'{items}': {e}"),
        })?
    };
    match value {
        Value::Array(values) => Ok(values),
        other => Err(FlowError::NonIterable {
            message: format!("'{items}' produced {other}"),
        }),
    }
}

/// Push the matching conditional branch as a new frame. Returns the executed
/// record payload.
pub fn enter_conditional(
    queue: &mut StepQueue,
    condition: &str,
    then_steps: &[Step],
    else_steps: &[Step],
    scope: &Map<String, Value>,
) -> Result<Value> {
    let taken = eval_condition(condition, scope)?;
    let branch = if taken { then_steps } else { else_steps };
    if !branch.is_empty() {
        queue.push_branch(branch.to_vec());
    }
    Ok(json!({ "condition": taken, "branch": if taken { "then" } else { "else" } }))
}

/// Enter a while loop: the condition is checked before the first iteration.
pub fn enter_while(
    queue: &mut StepQueue,
    step_id: &str,
    condition: &str,
    max_iterations: u32,
    body: &[Step],
    scope: &Map<String, Value>,
) -> Result<Value> {
    let entered = eval_condition(condition, scope)?;
    if entered {
        queue.push_while(
            step_id.to_string(),
            condition.to_string(),
            max_iterations,
            0,
            Arc::new(body.to_vec()),
        );
    }
    Ok(json!({ "entered": entered }))
}

/// Enter a foreach: items are evaluated once at entry; an empty sequence
/// completes with zero iterations.
pub fn enter_foreach(
    queue: &mut StepQueue,
    step_id: &str,
    items_expr: &str,
    body: &[Step],
    scope: &Map<String, Value>,
) -> Result<Value> {
    let items = eval_items(items_expr, scope)?;
    let total = items.len();
    if total > 0 {
        queue.push_foreach(step_id.to_string(), Arc::new(items), 0, Arc::new(body.to_vec()));
    }
    Ok(json!({ "items": total }))
}

/// Decide what happens after a loop frame is exhausted: push the next
/// iteration, stop, or raise `MAX_ITERATIONS_EXCEEDED`.
pub fn continue_loop_frame(
    queue: &mut StepQueue,
    kind: FrameKind,
    scope: &Map<String, Value>,
) -> Result<()> {
    match kind {
        FrameKind::While {
            step_id,
            condition,
            max_iterations,
            iteration,
            body,
        } => {
            if !eval_condition(&condition, scope)? {
                debug!(step_id = %step_id, iterations = iteration + 1, "while loop satisfied");
                return Ok(());
            }
            let next = iteration + 1;
            if next >= max_iterations {
                return Err(FlowError::MaxIterationsExceeded { max_iterations });
            }
            queue.push_while(step_id, condition, max_iterations, next, body);
            Ok(())
        }
        FrameKind::Foreach {
            step_id,
            items,
            index,
            body,
        } => {
            let next = index + 1;
            if next < items.len() {
                queue.push_foreach(step_id, items, next, body);
            }
            Ok(())
        }
        FrameKind::Sequence | FrameKind::Branch => Ok(()),
    }
}
