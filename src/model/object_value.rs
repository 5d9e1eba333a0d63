use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Value};

/// Dot-separated path to a field inside a document's data.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn from_dot_separated(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first_segment(&self) -> &str {
        &self.segments[0]
    }

    pub fn segment(&self, index: usize) -> &str {
        &self.segments[index]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn pop_first(&self) -> Self {
        Self {
            segments: self.segments[1..].to_vec(),
        }
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({})", self.canonical_string())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// An immutable document value: a JSON object plus structure-aware field
/// access. All "mutations" return a new `ObjectValue`.
#[derive(Clone, PartialEq)]
pub struct ObjectValue {
    data: Map<String, Value>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self { data: Map::new() }
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Convenience constructor for tests and callers holding a
    /// `serde_json::Value`; non-object values become the empty object.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(data) => Self { data },
            _ => Self::empty(),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let mut current: &Value = self.data.get(path.first_segment())?;
        for segment in path.segments().iter().skip(1) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Returns a copy with `value` stored at `path`, creating intermediate
    /// maps as needed.
    pub fn set(&self, path: &FieldPath, value: Value) -> Self {
        let mut data = self.data.clone();
        set_in_map(&mut data, path, 0, value);
        Self { data }
    }

    /// Returns a copy with the field at `path` removed. Removing an absent
    /// field is a no-op.
    pub fn delete(&self, path: &FieldPath) -> Self {
        let mut data = self.data.clone();
        delete_in_map(&mut data, path, 0);
        Self { data }
    }
}

fn set_in_map(map: &mut Map<String, Value>, path: &FieldPath, depth: usize, value: Value) {
    let segment = path.segment(depth);
    if depth == path.len() - 1 {
        map.insert(segment.to_string(), value);
        return;
    }
    let entry = map
        .entry(segment.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(child) = entry {
        set_in_map(child, path, depth + 1, value);
    }
}

fn delete_in_map(map: &mut Map<String, Value>, path: &FieldPath, depth: usize) {
    let segment = path.segment(depth);
    if depth == path.len() - 1 {
        map.remove(segment);
        return;
    }
    if let Some(Value::Object(child)) = map.get_mut(segment) {
        delete_in_map(child, path, depth + 1);
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectValue({})", Value::Object(self.data.clone()))
    }
}

/// The set of leaf field paths present in `value`, e.g. for building the
/// field mask of a synthesized patch.
pub fn field_mask(value: &ObjectValue) -> Vec<FieldPath> {
    fn walk(map: &Map<String, Value>, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
        for (key, child) in map {
            prefix.push(key.clone());
            match child {
                Value::Object(child_map) if !child_map.is_empty() => {
                    walk(child_map, prefix, out)
                }
                _ => out.push(FieldPath::new(prefix.clone())),
            }
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    walk(value.as_map(), &mut Vec::new(), &mut out);
    out
}

/// Relative order of a value's type in the cross-type ordering used by
/// query bounds and order-by evaluation.
fn type_order(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over field values: null < booleans < numbers < strings <
/// arrays < maps, with numeric comparison across integer/double
/// representations.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ordering = compare_values(x, y);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            // Maps compare by sorted key then value, key-wise.
            let mut a_keys: Vec<&String> = a.keys().collect();
            let mut b_keys: Vec<&String> = b.keys().collect();
            a_keys.sort();
            b_keys.sort();
            for (ka, kb) in a_keys.iter().zip(b_keys.iter()) {
                let ordering = ka.cmp(kb).then_with(|| compare_values(&a[*ka], &b[*kb]));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a_keys.len().cmp(&b_keys.len())
        }
        _ => Ordering::Equal,
    }
}

/// Canonical textual form used in target canonical ids. Type-tagged so
/// distinct values with the same textual rendering (e.g. `3` and `"3"`)
/// never collide.
pub fn canonical_id(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("bool:{b}"),
        Value::Number(n) => format!("num:{n}"),
        Value::String(s) => format!("str:{s}"),
        Value::Array(values) => {
            let parts: Vec<String> = values.iter().map(canonical_id).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", k, canonical_id(&map[*k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}
