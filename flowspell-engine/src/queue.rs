// ABOUTME: Per-workflow step queue: an explicit stack of nesting frames
// ABOUTME: No recursion for nested control flow; break/continue unwind frames

use flowspell_core::{FlowError, Result, Step};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// What a queue frame represents. Loop frames carry enough to decide the
/// next iteration when the frame is exhausted.
#[derive(Debug, Clone)]
pub enum FrameKind {
    /// The top-level step sequence.
    Sequence,
    /// A conditional branch body.
    Branch,
    /// One while-loop iteration.
    While {
        step_id: String,
        condition: String,
        max_iterations: u32,
        iteration: u32,
        body: Arc<Vec<Step>>,
    },
    /// One foreach iteration.
    Foreach {
        step_id: String,
        items: Arc<Vec<Value>>,
        index: usize,
        body: Arc<Vec<Step>>,
    },
}

impl FrameKind {
    fn is_loop(&self) -> bool {
        matches!(self, Self::While { .. } | Self::Foreach { .. })
    }
}

#[derive(Debug, Clone)]
struct Frame {
    remaining: VecDeque<Step>,
    kind: FrameKind,
}

/// Outcome of pulling from the queue.
#[derive(Debug)]
pub enum QueueEvent {
    /// The next step to process.
    Step(Step),
    /// A loop frame ran out of steps; the executor decides whether another
    /// iteration is pushed.
    FrameExhausted(FrameKind),
    /// No frames remain.
    Empty,
}

/// Stack-of-frames step queue. The top frame supplies the next step;
/// exhausting a non-loop frame pops it silently.
#[derive(Debug, Clone, Default)]
pub struct StepQueue {
    frames: Vec<Frame>,
}

impl StepQueue {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            frames: vec![Frame {
                remaining: steps.into(),
                kind: FrameKind::Sequence,
            }],
        }
    }

    /// Pull the next event. Loop-frame exhaustion is surfaced so the caller
    /// can apply continuation logic with access to state.
    pub fn advance(&mut self) -> QueueEvent {
        loop {
            let Some(top) = self.frames.last_mut() else {
                return QueueEvent::Empty;
            };
            if let Some(step) = top.remaining.pop_front() {
                return QueueEvent::Step(step);
            }
            let frame = self.frames.pop().expect("top frame exists");
            if frame.kind.is_loop() {
                return QueueEvent::FrameExhausted(frame.kind);
            }
        }
    }

    /// Put a step back at the front (retry re-dispatch).
    pub fn push_front_step(&mut self, step: Step) {
        if let Some(top) = self.frames.last_mut() {
            top.remaining.push_front(step);
        } else {
            self.frames.push(Frame {
                remaining: VecDeque::from([step]),
                kind: FrameKind::Sequence,
            });
        }
    }

    pub fn push_branch(&mut self, steps: Vec<Step>) {
        self.frames.push(Frame {
            remaining: steps.into(),
            kind: FrameKind::Branch,
        });
    }

    pub fn push_while(
        &mut self,
        step_id: String,
        condition: String,
        max_iterations: u32,
        iteration: u32,
        body: Arc<Vec<Step>>,
    ) {
        self.frames.push(Frame {
            remaining: body.iter().cloned().collect(),
            kind: FrameKind::While {
                step_id,
                condition,
                max_iterations,
                iteration,
                body,
            },
        });
    }

    pub fn push_foreach(
        &mut self,
        step_id: String,
        items: Arc<Vec<Value>>,
        index: usize,
        body: Arc<Vec<Step>>,
    ) {
        self.frames.push(Frame {
            remaining: body.iter().cloned().collect(),
            kind: FrameKind::Foreach {
                step_id,
                items,
                index,
                body,
            },
        });
    }

    /// Pop frames up to and including the innermost enclosing loop.
    pub fn break_loop(&mut self) -> Result<()> {
        if !self.frames.iter().any(|f| f.kind.is_loop()) {
            return Err(FlowError::BreakOutsideLoop);
        }
        while let Some(frame) = self.frames.pop() {
            if frame.kind.is_loop() {
                return Ok(());
            }
        }
        unreachable!("loop frame was present");
    }

    /// Pop frames above the innermost enclosing loop and drain that loop
    /// frame, so the next advance applies its continuation logic.
    pub fn continue_loop(&mut self) -> Result<()> {
        if !self.frames.iter().any(|f| f.kind.is_loop()) {
            return Err(FlowError::ContinueOutsideLoop);
        }
        while let Some(top) = self.frames.last_mut() {
            if top.kind.is_loop() {
                top.remaining.clear();
                return Ok(());
            }
            self.frames.pop();
        }
        unreachable!("loop frame was present");
    }

    /// Bindings contributed by the innermost loop frame: `item`/`index`/
    /// `total` (foreach) or `iteration` (while), plus a `loop` object.
    pub fn loop_bindings(&self) -> Option<Map<String, Value>> {
        for frame in self.frames.iter().rev() {
            match &frame.kind {
                FrameKind::Foreach { items, index, .. } => {
                    let item = items.get(*index).cloned().unwrap_or(Value::Null);
                    let mut bindings = Map::new();
                    bindings.insert("item".to_string(), item.clone());
                    bindings.insert("index".to_string(), Value::from(*index as i64));
                    bindings.insert("total".to_string(), Value::from(items.len() as i64));
                    let mut loop_obj = Map::new();
                    loop_obj.insert("item".to_string(), item);
                    loop_obj.insert("index".to_string(), Value::from(*index as i64));
                    loop_obj.insert("total".to_string(), Value::from(items.len() as i64));
                    bindings.insert("loop".to_string(), Value::Object(loop_obj));
                    return Some(bindings);
                }
                FrameKind::While { iteration, .. } => {
                    let mut bindings = Map::new();
                    bindings.insert("iteration".to_string(), Value::from(*iteration as i64));
                    let mut loop_obj = Map::new();
                    loop_obj.insert("iteration".to_string(), Value::from(*iteration as i64));
                    bindings.insert("loop".to_string(), Value::Object(loop_obj));
                    return Some(bindings);
                }
                _ => {}
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(|f| f.remaining.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowspell_core::StepKind;

    fn msg(id: &str) -> Step {
        Step::new(
            id,
            StepKind::UserMessage {
                message: id.to_string(),
            },
        )
    }

    #[test]
    fn sequence_drains_in_order() {
        let mut queue = StepQueue::new(vec![msg("a"), msg("b")]);
        assert!(matches!(queue.advance(), QueueEvent::Step(s) if s.id == "a"));
        assert!(matches!(queue.advance(), QueueEvent::Step(s) if s.id == "b"));
        assert!(matches!(queue.advance(), QueueEvent::Empty));
    }

    #[test]
    fn branch_frames_pop_silently() {
        let mut queue = StepQueue::new(vec![msg("tail")]);
        queue.push_branch(vec![msg("branch")]);
        assert!(matches!(queue.advance(), QueueEvent::Step(s) if s.id == "branch"));
        assert!(matches!(queue.advance(), QueueEvent::Step(s) if s.id == "tail"));
    }

    #[test]
    fn loop_exhaustion_is_surfaced() {
        let mut queue = StepQueue::new(vec![]);
        let body = Arc::new(vec![msg("body")]);
        queue.push_while("w".into(), "true".into(), 3, 0, body);
        assert!(matches!(queue.advance(), QueueEvent::Step(_)));
        assert!(matches!(
            queue.advance(),
            QueueEvent::FrameExhausted(FrameKind::While { iteration: 0, .. })
        ));
    }

    #[test]
    fn break_pops_through_branches_to_the_loop() {
        let mut queue = StepQueue::new(vec![msg("after")]);
        let body = Arc::new(vec![msg("x")]);
        queue.push_foreach("f".into(), Arc::new(vec![Value::from(1)]), 0, body);
        queue.push_branch(vec![msg("inside_branch")]);
        queue.break_loop().unwrap();
        // foreach frame gone, sequence continues
        assert!(matches!(queue.advance(), QueueEvent::Step(s) if s.id == "after"));
    }

    #[test]
    fn break_outside_loop_errors_without_damage() {
        let mut queue = StepQueue::new(vec![msg("a")]);
        let err = queue.break_loop().unwrap_err();
        assert_eq!(err.code(), "BREAK_OUTSIDE_LOOP");
        assert!(matches!(queue.advance(), QueueEvent::Step(s) if s.id == "a"));
    }

    #[test]
    fn continue_drains_the_loop_frame_only() {
        let mut queue = StepQueue::new(vec![]);
        let body = Arc::new(vec![msg("first"), msg("second")]);
        queue.push_foreach(
            "f".into(),
            Arc::new(vec![Value::from(1), Value::from(2)]),
            0,
            body,
        );
        queue.push_branch(vec![msg("branch_step")]);
        queue.continue_loop().unwrap();
        // branch gone, loop frame drained: next event is exhaustion
        assert!(matches!(
            queue.advance(),
            QueueEvent::FrameExhausted(FrameKind::Foreach { index: 0, .. })
        ));
    }

    #[test]
    fn continue_outside_loop_errors() {
        let mut queue = StepQueue::new(vec![]);
        assert_eq!(
            queue.continue_loop().unwrap_err().code(),
            "CONTINUE_OUTSIDE_LOOP"
        );
    }

    #[test]
    fn foreach_bindings_expose_item_index_total() {
        let mut queue = StepQueue::new(vec![]);
        let items = Arc::new(vec![Value::from("a"), Value::from("b")]);
        queue.push_foreach("f".into(), items, 1, Arc::new(vec![msg("x")]));
        let bindings = queue.loop_bindings().unwrap();
        assert_eq!(bindings["item"], Value::from("b"));
        assert_eq!(bindings["index"], Value::from(1));
        assert_eq!(bindings["total"], Value::from(2));
        assert_eq!(bindings["loop"]["index"], Value::from(1));
    }

    #[test]
    fn innermost_loop_wins_for_bindings() {
        let mut queue = StepQueue::new(vec![]);
        queue.push_foreach(
            "outer".into(),
            Arc::new(vec![Value::from("o")]),
            0,
            Arc::new(vec![]),
        );
        queue.push_while("inner".into(), "true".into(), 5, 2, Arc::new(vec![msg("x")]));
        let bindings = queue.loop_bindings().unwrap();
        assert_eq!(bindings["iteration"], Value::from(2));
        assert!(bindings.get("item").is_none());
    }
}
