use crate::core::query::{Bound, Filter, OrderBy};
use crate::model::object_value::canonical_id as value_canonical_id;
use crate::model::resource_path::ResourcePath;
use crate::model::DocumentKey;

/// The server-facing shape of a query: what gets sent on the listen stream
/// and keyed in the target cache.
///
/// Unlike [`Query`](crate::core::query::Query), a target's order-by list is
/// already normalized (key ordering appended). Two queries with the same
/// canonical id share one target and one watch subscription.
#[derive(Clone, Debug)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// A target that watches exactly one document.
    pub fn for_document(key: DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    /// True for point lookups; these get special existence-filter and
    /// limbo handling because an empty result proves deletion.
    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Stable textual identity. Every component is type-tagged, so values
    /// that render alike (e.g. the number `3` and the string `"3"`) can
    /// never produce colliding ids.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_string());
            id.push(',');
        }
        id.push_str("|ob:");
        for order_by in &self.order_by {
            id.push_str(&order_by.canonical_string());
            id.push(',');
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str(&format!("|lb:{}", bound_canonical_id(bound)));
        }
        if let Some(bound) = &self.end_at {
            id.push_str(&format!("|ub:{}", bound_canonical_id(bound)));
        }
        id
    }
}

fn bound_canonical_id(bound: &Bound) -> String {
    let position: Vec<String> = bound.position.iter().map(value_canonical_id).collect();
    format!(
        "{}:{}",
        if bound.before { "b" } else { "a" },
        position.join(",")
    )
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Target {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, FilterOp};
    use crate::model::object_value::FieldPath;
    use serde_json::json;

    #[test]
    fn document_target_detection() {
        let target = Target::for_document(DocumentKey::from_path_string("rooms/eros").unwrap());
        assert!(target.is_document_target());

        let collection = Target {
            path: ResourcePath::from_string("rooms").unwrap(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        };
        assert!(!collection.is_document_target());
    }

    #[test]
    fn canonical_id_distinguishes_value_types() {
        let base = |value| Target {
            path: ResourcePath::from_string("docs").unwrap(),
            collection_group: None,
            filters: vec![Filter::new(
                FieldPath::from_dot_separated("a"),
                FilterOp::Equal,
                value,
            )],
            order_by: vec![OrderBy::key_ordering(Direction::Ascending)],
            limit: None,
            start_at: None,
            end_at: None,
        };
        assert_ne!(
            base(json!(3)).canonical_id(),
            base(json!("3")).canonical_id()
        );
    }

    #[test]
    fn equal_targets_share_canonical_id() {
        let key = DocumentKey::from_path_string("rooms/eros").unwrap();
        assert_eq!(
            Target::for_document(key.clone()),
            Target::for_document(key)
        );
    }
}
