use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::model::document::Document;
use crate::model::object_value::{canonical_id, compare_values, FieldPath};
use crate::model::resource_path::ResourcePath;
use crate::model::DocumentKey;
use crate::core::target::Target;
use crate::util::sorted_map::Comparator;

/// Field path name that refers to the document key itself.
pub const KEY_FIELD_PATH: &str = "__name__";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterOp {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
}

impl FilterOp {
    pub fn canonical_string(&self) -> &'static str {
        match self {
            FilterOp::LessThan => "<",
            FilterOp::LessThanOrEqual => "<=",
            FilterOp::Equal => "==",
            FilterOp::NotEqual => "!=",
            FilterOp::GreaterThan => ">",
            FilterOp::GreaterThanOrEqual => ">=",
            FilterOp::ArrayContains => "array-contains",
            FilterOp::In => "in",
            FilterOp::ArrayContainsAny => "array-contains-any",
        }
    }

    fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOp::LessThan
                | FilterOp::LessThanOrEqual
                | FilterOp::GreaterThan
                | FilterOp::GreaterThanOrEqual
                | FilterOp::NotEqual
        )
    }
}

/// A single field comparison applied to candidate documents.
#[derive(Clone, PartialEq, Debug)]
pub struct Filter {
    pub field: FieldPath,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: FieldPath, op: FilterOp, value: Value) -> Self {
        Self { field, op, value }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let field_value = match doc.data.field(&self.field) {
            Some(value) => value,
            None => return false,
        };
        match self.op {
            FilterOp::Equal => compare_values(field_value, &self.value) == Ordering::Equal,
            FilterOp::NotEqual => compare_values(field_value, &self.value) != Ordering::Equal,
            FilterOp::ArrayContains => match field_value {
                Value::Array(values) => values.contains(&self.value),
                _ => false,
            },
            FilterOp::In => match &self.value {
                Value::Array(values) => values.contains(field_value),
                _ => false,
            },
            FilterOp::ArrayContainsAny => match (field_value, &self.value) {
                (Value::Array(doc_values), Value::Array(filter_values)) => {
                    doc_values.iter().any(|v| filter_values.contains(v))
                }
                _ => false,
            },
            op => {
                // Range comparisons only match values of the same type.
                if !same_type_order(field_value, &self.value) {
                    return false;
                }
                let ordering = compare_values(field_value, &self.value);
                match op {
                    FilterOp::LessThan => ordering == Ordering::Less,
                    FilterOp::LessThanOrEqual => ordering != Ordering::Greater,
                    FilterOp::GreaterThan => ordering == Ordering::Greater,
                    FilterOp::GreaterThanOrEqual => ordering != Ordering::Less,
                    _ => false,
                }
            }
        }
    }

    pub fn canonical_string(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.canonical_string(),
            canonical_id(&self.value)
        )
    }
}

fn same_type_order(a: &Value, b: &Value) -> bool {
    use serde_json::Value::*;
    matches!(
        (a, b),
        (Null, Null)
            | (Bool(_), Bool(_))
            | (Number(_), Number(_))
            | (String(_), String(_))
            | (Array(_), Array(_))
            | (Object(_), Object(_))
    )
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn canonical_string(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct OrderBy {
    pub field: FieldPath,
    pub dir: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, dir: Direction) -> Self {
        Self { field, dir }
    }

    pub fn key_ordering(dir: Direction) -> Self {
        Self {
            field: FieldPath::from_dot_separated(KEY_FIELD_PATH),
            dir,
        }
    }

    pub fn is_key_ordering(&self) -> bool {
        self.field.len() == 1 && self.field.first_segment() == KEY_FIELD_PATH
    }

    fn compare(&self, d1: &Document, d2: &Document) -> Ordering {
        let ordering = if self.is_key_ordering() {
            d1.key.cmp(&d2.key)
        } else {
            match (d1.data.field(&self.field), d2.data.field(&self.field)) {
                (Some(v1), Some(v2)) => compare_values(v1, v2),
                // Matching documents always carry every order-by field;
                // treat a missing field as smallest for robustness.
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.dir {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub fn canonical_string(&self) -> String {
        format!(
            "{}:{}",
            self.field.canonical_string(),
            self.dir.canonical_string()
        )
    }
}

/// Position in the ordering defined by a query's order-by list. `before`
/// selects whether the bound itself is included.
#[derive(Clone, PartialEq, Debug)]
pub struct Bound {
    pub position: Vec<Value>,
    pub before: bool,
}

/// A user-facing query: a target plus the implicit key ordering that makes
/// result order deterministic.
#[derive(Clone, Debug)]
pub struct Query {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub explicit_order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Query {
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The full ordering: explicit order-bys, then the inequality field if
    /// it was not ordered explicitly, then the key ordering.
    pub fn order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        if result.is_empty() {
            if let Some(inequality) = self.inequality_field() {
                result.push(OrderBy::new(inequality, Direction::Ascending));
            }
        }
        if !result.iter().any(OrderBy::is_key_ordering) {
            let dir = result
                .last()
                .map(|o| o.dir)
                .unwrap_or(Direction::Ascending);
            result.push(OrderBy::key_ordering(dir));
        }
        result
    }

    fn inequality_field(&self) -> Option<FieldPath> {
        self.filters
            .iter()
            .find(|f| f.op.is_inequality())
            .map(|f| f.field.clone())
    }

    /// True when this query names exactly one document.
    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path(doc)
            && self.matches_order_by(doc)
            && self.filters.iter().all(|f| f.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, doc: &Document) -> bool {
        let doc_path = doc.key.path();
        if let Some(group) = &self.collection_group {
            doc.key.collection_id() == group && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_path(&self.path) {
            self.path == *doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    /// A document must define every explicitly ordered field to show up in
    /// the results.
    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|o| o.is_key_ordering() || doc.data.field(&o.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.order_by();
        if let Some(bound) = &self.start_at {
            if !bound_sorts_before(bound, &order_by, doc) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if bound_sorts_before(bound, &order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Total order over documents matching this query.
    pub fn compare(&self, d1: &Document, d2: &Document) -> Ordering {
        for order_by in self.order_by() {
            let ordering = order_by.compare(d1, d2);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn comparator(&self) -> Comparator<Document> {
        let query = self.clone();
        Arc::new(move |d1: &Document, d2: &Document| query.compare(d1, d2))
    }

    pub fn to_target(&self) -> Target {
        Target {
            path: self.path.clone(),
            collection_group: self.collection_group.clone(),
            filters: self.filters.clone(),
            order_by: self.order_by(),
            limit: self.limit,
            start_at: self.start_at.clone(),
            end_at: self.end_at.clone(),
        }
    }

    pub fn canonical_id(&self) -> String {
        self.to_target().canonical_id()
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Query {}

/// Whether the bound's position sorts at or before `doc` in the given
/// ordering (inclusive when `before` is set).
fn bound_sorts_before(bound: &Bound, order_by: &[OrderBy], doc: &Document) -> bool {
    let mut ordering = Ordering::Equal;
    for (component, order) in bound.position.iter().zip(order_by.iter()) {
        let component_ordering = if order.is_key_ordering() {
            match component.as_str() {
                Some(path) => match DocumentKey::from_path_string(path) {
                    Ok(key) => key.cmp(&doc.key),
                    Err(_) => Ordering::Less,
                },
                None => Ordering::Less,
            }
        } else {
            match doc.data.field(&order.field) {
                Some(doc_value) => compare_values(component, doc_value),
                None => Ordering::Greater,
            }
        };
        let component_ordering = match order.dir {
            Direction::Ascending => component_ordering,
            Direction::Descending => component_ordering.reverse(),
        };
        if component_ordering != Ordering::Equal {
            ordering = component_ordering;
            break;
        }
    }
    if bound.before {
        ordering != Ordering::Greater
    } else {
        ordering == Ordering::Less
    }
}
