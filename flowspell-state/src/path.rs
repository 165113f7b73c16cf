// ABOUTME: Dot-path addressing into the three state tiers
// ABOUTME: Parsing, validation, and get/set/increment/append on JSON trees

use flowspell_core::{FlowError, Result, UpdateKind};
use serde_json::{Map, Value};

/// The three state tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Inputs,
    State,
    Computed,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inputs => "inputs",
            Self::State => "state",
            Self::Computed => "computed",
        }
    }
}

/// One step in a dot path: a map key or a numeric list index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed state path: tier plus segments below it.
///
/// A bare path with no tier prefix addresses the `state` tier, so
/// `counter` and `state.counter` are the same location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePath {
    pub tier: Tier,
    pub segments: Vec<PathSegment>,
}

impl StatePath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(FlowError::invalid_path("path must not be empty"));
        }
        let mut parts = raw.split('.');
        let first = parts.next().unwrap_or_default();
        let (tier, mut segments) = match first {
            "inputs" => (Tier::Inputs, Vec::new()),
            "state" => (Tier::State, Vec::new()),
            "computed" => (Tier::Computed, Vec::new()),
            other => (Tier::State, vec![parse_segment(raw, other)?]),
        };
        for part in parts {
            segments.push(parse_segment(raw, part)?);
        }
        if segments.is_empty() {
            return Err(FlowError::invalid_path(format!(
                "path '{raw}' addresses a whole tier"
            )));
        }
        Ok(Self { tier, segments })
    }

    /// Parse a path that must be writable (the `state` tier only).
    pub fn parse_writable(raw: &str) -> Result<Self> {
        let path = Self::parse(raw)?;
        match path.tier {
            Tier::State => Ok(path),
            Tier::Inputs => Err(FlowError::invalid_path(format!(
                "cannot write '{raw}': inputs are immutable after start"
            ))),
            Tier::Computed => Err(FlowError::invalid_path(format!(
                "cannot write '{raw}': computed fields are derived"
            ))),
        }
    }

    /// Dotted form including the tier prefix.
    pub fn canonical(&self) -> String {
        let mut out = self.tier.as_str().to_string();
        for segment in &self.segments {
            out.push('.');
            match segment {
                PathSegment::Key(k) => out.push_str(k),
                PathSegment::Index(i) => out.push_str(&i.to_string()),
            }
        }
        out
    }

    /// Whether two paths overlap: one is a prefix of the other (same tier).
    /// A write to `state.a` touches `state.a.b`, and vice versa.
    pub fn overlaps(&self, other: &StatePath) -> bool {
        if self.tier != other.tier {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a == b)
    }
}

fn parse_segment(raw: &str, part: &str) -> Result<PathSegment> {
    if part.is_empty() {
        return Err(FlowError::invalid_path(format!(
            "path '{raw}' has an empty segment"
        )));
    }
    if part.chars().all(|c| c.is_ascii_digit()) {
        let index = part
            .parse::<usize>()
            .map_err(|_| FlowError::invalid_path(format!("bad index in path '{raw}'")))?;
        return Ok(PathSegment::Index(index));
    }
    Ok(PathSegment::Key(part.to_string()))
}

/// Read a value at `segments` below a tier root. Absent locations are `None`.
pub fn get_at<'a>(root: &'a Map<String, Value>, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current: Option<&Value> = match segments.first()? {
        PathSegment::Key(k) => root.get(k),
        PathSegment::Index(_) => None,
    };
    for segment in &segments[1..] {
        current = match (current, segment) {
            (Some(Value::Object(map)), PathSegment::Key(k)) => map.get(k),
            (Some(Value::Array(items)), PathSegment::Index(i)) => items.get(*i),
            _ => None,
        };
    }
    current
}

/// Apply a write operation at `segments` below a tier root, creating
/// intermediate mappings as needed. Non-mapping intermediates are replaced.
pub fn apply_at(
    root: &mut Map<String, Value>,
    segments: &[PathSegment],
    value: Value,
    operation: UpdateKind,
) -> Result<()> {
    let (leaf, parents) = segments
        .split_last()
        .ok_or_else(|| FlowError::invalid_path("path has no leaf"))?;

    let mut current: &mut Value = {
        let first = match parents.first().or(Some(leaf)) {
            Some(PathSegment::Key(k)) => k,
            _ => return Err(FlowError::invalid_path("path must start with a key")),
        };
        if parents.is_empty() {
            return apply_leaf(root.entry(first.clone()).or_insert(Value::Null), value, operation);
        }
        root.entry(first.clone()).or_insert_with(empty_map)
    };

    for segment in &parents[1..] {
        match segment {
            PathSegment::Key(k) => {
                if !current.is_object() {
                    *current = empty_map();
                }
                current = current
                    .as_object_mut()
                    .expect("just ensured object")
                    .entry(k.clone())
                    .or_insert_with(empty_map);
            }
            PathSegment::Index(i) => {
                let items = current.as_array_mut().ok_or_else(|| {
                    FlowError::invalid_path("numeric segment requires a list")
                })?;
                let slot = items
                    .get_mut(*i)
                    .ok_or_else(|| FlowError::invalid_path("list index out of range"))?;
                current = slot;
            }
        }
    }

    match leaf {
        PathSegment::Key(k) => {
            if !current.is_object() {
                *current = empty_map();
            }
            let slot = current
                .as_object_mut()
                .expect("just ensured object")
                .entry(k.clone())
                .or_insert(Value::Null);
            apply_leaf(slot, value, operation)
        }
        PathSegment::Index(i) => {
            let items = current
                .as_array_mut()
                .ok_or_else(|| FlowError::invalid_path("numeric segment requires a list"))?;
            let slot = items
                .get_mut(*i)
                .ok_or_else(|| FlowError::invalid_path("list index out of range"))?;
            apply_leaf(slot, value, operation)
        }
    }
}

fn empty_map() -> Value {
    Value::Object(Map::new())
}

fn apply_leaf(slot: &mut Value, value: Value, operation: UpdateKind) -> Result<()> {
    match operation {
        UpdateKind::Set => {
            *slot = value;
            Ok(())
        }
        UpdateKind::Increment => {
            let by = match &value {
                Value::Null => 1.0,
                Value::Number(n) => n
                    .as_f64()
                    .ok_or_else(|| FlowError::validation("increment amount must be finite"))?,
                _ => {
                    return Err(FlowError::validation(
                        "increment requires a numeric amount",
                    ))
                }
            };
            let current = match slot {
                Value::Null => 0.0,
                Value::Number(n) => n
                    .as_f64()
                    .ok_or_else(|| FlowError::validation("increment target must be finite"))?,
                _ => {
                    return Err(FlowError::validation(
                        "increment target must be a number",
                    ))
                }
            };
            let sum = current + by;
            *slot = if sum.fract() == 0.0 && sum.abs() < (i64::MAX as f64) {
                Value::from(sum as i64)
            } else {
                serde_json::Number::from_f64(sum)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            };
            Ok(())
        }
        UpdateKind::Append => match slot {
            Value::Null => {
                *slot = Value::Array(vec![value]);
                Ok(())
            }
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(FlowError::validation("append target must be a list")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_detects_tiers() {
        assert_eq!(StatePath::parse("state.counter").unwrap().tier, Tier::State);
        assert_eq!(StatePath::parse("inputs.name").unwrap().tier, Tier::Inputs);
        assert_eq!(
            StatePath::parse("computed.doubled").unwrap().tier,
            Tier::Computed
        );
        // bare paths are state-tier shorthand
        let bare = StatePath::parse("counter").unwrap();
        assert_eq!(bare.tier, Tier::State);
        assert_eq!(bare.canonical(), "state.counter");
    }

    #[test]
    fn writable_rejects_inputs_and_computed() {
        assert!(StatePath::parse_writable("state.x").is_ok());
        let err = StatePath::parse_writable("inputs.name").unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
        let err = StatePath::parse_writable("computed.doubled").unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
    }

    #[test]
    fn whole_tier_paths_rejected() {
        assert!(StatePath::parse("state").is_err());
        assert!(StatePath::parse("").is_err());
    }

    #[test]
    fn overlap_is_prefix_in_either_direction() {
        let a = StatePath::parse("state.a").unwrap();
        let ab = StatePath::parse("state.a.b").unwrap();
        let c = StatePath::parse("state.c").unwrap();
        assert!(a.overlaps(&ab));
        assert!(ab.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut root = Map::new();
        let path = StatePath::parse("state.a.b.c").unwrap();
        apply_at(&mut root, &path.segments, json!(1), UpdateKind::Set).unwrap();
        assert_eq!(get_at(&root, &path.segments), Some(&json!(1)));
    }

    #[test]
    fn increment_defaults_to_one_and_starts_at_zero() {
        let mut root = Map::new();
        let path = StatePath::parse("state.n").unwrap();
        apply_at(&mut root, &path.segments, Value::Null, UpdateKind::Increment).unwrap();
        apply_at(&mut root, &path.segments, json!(4), UpdateKind::Increment).unwrap();
        assert_eq!(get_at(&root, &path.segments), Some(&json!(5)));
    }

    #[test]
    fn increment_rejects_non_numeric_target() {
        let mut root = Map::new();
        let path = StatePath::parse("state.s").unwrap();
        apply_at(&mut root, &path.segments, json!("text"), UpdateKind::Set).unwrap();
        let err = apply_at(&mut root, &path.segments, json!(1), UpdateKind::Increment).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn append_creates_and_extends_lists() {
        let mut root = Map::new();
        let path = StatePath::parse("state.items").unwrap();
        apply_at(&mut root, &path.segments, json!("x"), UpdateKind::Append).unwrap();
        apply_at(&mut root, &path.segments, json!("y"), UpdateKind::Append).unwrap();
        assert_eq!(get_at(&root, &path.segments), Some(&json!(["x", "y"])));
    }

    #[test]
    fn list_index_reads_and_writes() {
        let mut root = Map::new();
        let list = StatePath::parse("state.items").unwrap();
        apply_at(&mut root, &list.segments, json!(["a", "b"]), UpdateKind::Set).unwrap();
        let second = StatePath::parse("state.items.1").unwrap();
        assert_eq!(get_at(&root, &second.segments), Some(&json!("b")));
        apply_at(&mut root, &second.segments, json!("B"), UpdateKind::Set).unwrap();
        assert_eq!(get_at(&root, &list.segments), Some(&json!(["a", "B"])));
    }
}
