// ABOUTME: Three-tier reactive state store: inputs, state, computed
// ABOUTME: Transactional updates with dependency-ordered computed re-evaluation

pub mod computed;
pub mod path;
pub mod store;

pub use computed::ComputedGraph;
pub use path::{PathSegment, StatePath, Tier};
pub use store::{StateSnapshot, StateStore, UpdateOutcome};
