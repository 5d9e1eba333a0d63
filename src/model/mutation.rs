use serde_json::{json, Value};

use crate::model::document::{Document, DocumentState, MaybeDocument, NoDocument, UnknownDocument};
use crate::model::document_key::DocumentKey;
use crate::model::object_value::{FieldPath, ObjectValue};
use crate::model::snapshot_version::SnapshotVersion;
use crate::util::assert::{fail, hard_assert};

/// Guard a mutation against concurrent modification. A mutation whose
/// precondition does not hold against the current document is a no-op
/// locally and is rejected by the server.
#[derive(Clone, PartialEq, Debug)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_validated_by(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                let is_document = matches!(maybe_doc, Some(MaybeDocument::Document(_)));
                *exists == is_document
            }
            Precondition::UpdateTime(version) => match maybe_doc {
                Some(MaybeDocument::Document(doc)) => doc.version == *version,
                _ => false,
            },
        }
    }
}

/// A field-level transform evaluated by the server, with a local
/// approximation applied while the write is in flight.
#[derive(Clone, PartialEq, Debug)]
pub enum TransformOperation {
    ServerTimestamp,
    Increment(Value),
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
}

impl TransformOperation {
    /// Value to show locally before the server result arrives.
    fn apply_to_local_view(
        &self,
        previous: Option<&Value>,
        local_write_time: SnapshotVersion,
    ) -> Value {
        match self {
            TransformOperation::ServerTimestamp => json!({
                "__type__": "server_timestamp",
                "seconds": local_write_time.seconds(),
                "nanoseconds": local_write_time.nanoseconds(),
            }),
            TransformOperation::Increment(operand) => {
                increment(previous, operand)
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        }
    }

    /// Value to store once the server has evaluated the transform.
    fn apply_to_remote_document(
        &self,
        previous: Option<&Value>,
        transform_result: &Value,
    ) -> Value {
        match self {
            // The server is authoritative for these.
            TransformOperation::ServerTimestamp | TransformOperation::Increment(_) => {
                transform_result.clone()
            }
            // Array transforms apply against the local state; the server
            // result carries no extra information.
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        }
    }

    /// The portion of the previous value a retry must be replayed against.
    /// Only numeric increments are non-idempotent and need one.
    fn compute_base_value(&self, previous: Option<&Value>) -> Option<Value> {
        match self {
            TransformOperation::Increment(_) => Some(match previous {
                Some(value @ Value::Number(_)) => value.clone(),
                _ => json!(0),
            }),
            _ => None,
        }
    }
}

fn increment(previous: Option<&Value>, operand: &Value) -> Value {
    let base = match previous {
        Some(Value::Number(n)) => Some(n.clone()),
        _ => None,
    };
    match (base.as_ref().and_then(|n| n.as_i64()), operand.as_i64()) {
        (Some(a), Some(b)) => json!(a.saturating_add(b)),
        _ => {
            let a = base.as_ref().and_then(|n| n.as_f64()).unwrap_or(0.0);
            let b = operand.as_f64().unwrap_or(0.0);
            json!(a + b)
        }
    }
}

fn array_union(previous: Option<&Value>, elements: &[Value]) -> Value {
    let mut result = match previous {
        Some(Value::Array(values)) => values.clone(),
        _ => Vec::new(),
    };
    for element in elements {
        if !result.contains(element) {
            result.push(element.clone());
        }
    }
    Value::Array(result)
}

fn array_remove(previous: Option<&Value>, elements: &[Value]) -> Value {
    let mut result = match previous {
        Some(Value::Array(values)) => values.clone(),
        _ => Vec::new(),
    };
    result.retain(|value| !elements.contains(value));
    Value::Array(result)
}

#[derive(Clone, PartialEq, Debug)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub transform: TransformOperation,
}

/// Server-reported outcome of one mutation within an acknowledged batch.
#[derive(Clone, Debug)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Option<Vec<Value>>,
}

/// A self-contained change to a single document.
///
/// Applying a mutation is a pure function of the mutation and the current
/// document state; the engine re-derives local views by replaying
/// mutations over cached server state.
#[derive(Clone, PartialEq, Debug)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: Vec<FieldPath>,
        precondition: Precondition,
    },
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition.clone(),
            // Transforms only make sense against an existing document.
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    /// Applies this mutation as acknowledged by the server. The result is
    /// always a concrete document state carrying committed mutations,
    /// since the server has accepted the write even if the watch stream
    /// has not caught up.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> MaybeDocument {
        if let Some(doc) = maybe_doc {
            hard_assert(
                doc.key() == self.key(),
                format!(
                    "applied mutation for {} to document {}",
                    self.key(),
                    doc.key()
                ),
            );
        }
        match self {
            Mutation::Set { key, value, .. } => MaybeDocument::Document(Document {
                key: key.clone(),
                version: result.version,
                data: value.clone(),
                state: DocumentState::CommittedMutations,
            }),
            Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
            } => {
                if !precondition.is_validated_by(maybe_doc) {
                    // The server accepted the write but we cannot compute
                    // its effect against local state.
                    return MaybeDocument::UnknownDocument(UnknownDocument {
                        key: key.clone(),
                        version: result.version,
                    });
                }
                let new_data = patch_document(data, field_mask, maybe_doc);
                MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: result.version,
                    data: new_data,
                    state: DocumentState::CommittedMutations,
                })
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let transform_results = match &result.transform_results {
                    Some(results) => results,
                    None => fail("transform mutation acknowledged without transform results"),
                };
                let doc = match maybe_doc {
                    Some(MaybeDocument::Document(doc)) => doc,
                    _ => {
                        // Can't transform a document we never saw.
                        return MaybeDocument::UnknownDocument(UnknownDocument {
                            key: key.clone(),
                            version: result.version,
                        });
                    }
                };
                hard_assert(
                    transform_results.len() == field_transforms.len(),
                    "server transform result count does not match transform count",
                );
                let mut data = doc.data.clone();
                for (field_transform, server_result) in
                    field_transforms.iter().zip(transform_results.iter())
                {
                    let previous = doc.data.field(&field_transform.field);
                    let value = field_transform
                        .transform
                        .apply_to_remote_document(previous, server_result);
                    data = data.set(&field_transform.field, value);
                }
                MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: result.version,
                    data,
                    state: DocumentState::CommittedMutations,
                })
            }
            Mutation::Delete { key, .. } => MaybeDocument::NoDocument(NoDocument {
                key: key.clone(),
                version: result.version,
                has_committed_mutations: true,
            }),
            Mutation::Verify { .. } => {
                fail("verify mutations are transaction-only and are never applied")
            }
        }
    }

    /// Applies this mutation speculatively while it is still pending.
    /// Returns the input unchanged when the precondition does not hold.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        local_write_time: SnapshotVersion,
    ) -> Option<MaybeDocument> {
        if !self.precondition().is_validated_by(maybe_doc.as_ref()) {
            return maybe_doc;
        }
        match self {
            Mutation::Set { key, value, .. } => {
                Some(MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: post_mutation_version(maybe_doc.as_ref()),
                    data: value.clone(),
                    state: DocumentState::LocalMutations,
                }))
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                let new_data = patch_document(data, field_mask, maybe_doc.as_ref());
                Some(MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: post_mutation_version(maybe_doc.as_ref()),
                    data: new_data,
                    state: DocumentState::LocalMutations,
                }))
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let doc = match maybe_doc.as_ref() {
                    Some(MaybeDocument::Document(doc)) => doc,
                    _ => fail("transform precondition validated against a missing document"),
                };
                let mut data = doc.data.clone();
                for field_transform in field_transforms {
                    let previous = doc.data.field(&field_transform.field);
                    let value = field_transform
                        .transform
                        .apply_to_local_view(previous, local_write_time);
                    data = data.set(&field_transform.field, value);
                }
                Some(MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: doc.version,
                    data,
                    state: DocumentState::LocalMutations,
                }))
            }
            Mutation::Delete { key, .. } => Some(MaybeDocument::NoDocument(NoDocument {
                key: key.clone(),
                version: SnapshotVersion::min(),
                has_committed_mutations: false,
            })),
            Mutation::Verify { .. } => {
                fail("verify mutations are transaction-only and are never applied")
            }
        }
    }

    /// Captures the pre-image a non-idempotent transform must replay
    /// against (numeric increments). Returns `None` when this mutation is
    /// idempotent.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<ObjectValue> {
        let field_transforms = match self {
            Mutation::Transform {
                field_transforms, ..
            } => field_transforms,
            _ => return None,
        };
        let existing = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base: Option<ObjectValue> = None;
        for field_transform in field_transforms {
            let previous = existing.and_then(|doc| doc.data.field(&field_transform.field));
            if let Some(coerced) = field_transform.transform.compute_base_value(previous) {
                let updated = base
                    .unwrap_or_else(ObjectValue::empty)
                    .set(&field_transform.field, coerced);
                base = Some(updated);
            }
        }
        base
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version,
        _ => SnapshotVersion::min(),
    }
}

/// Applies a patch's masked fields over the existing document data.
fn patch_document(
    data: &ObjectValue,
    field_mask: &[FieldPath],
    maybe_doc: Option<&MaybeDocument>,
) -> ObjectValue {
    let mut result = match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.data.clone(),
        _ => ObjectValue::empty(),
    };
    for path in field_mask {
        match data.field(path) {
            Some(value) => result = result.set(path, value.clone()),
            None => result = result.delete(path),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> DocumentKey {
        DocumentKey::from_path_string("collection/doc").unwrap()
    }

    fn doc(version: i64, data: Value, state: DocumentState) -> MaybeDocument {
        MaybeDocument::Document(Document {
            key: key(),
            version: SnapshotVersion::new(version, 0),
            data: ObjectValue::from_value(data),
            state,
        })
    }

    #[test]
    fn set_applies_locally_with_local_mutations() {
        let mutation = Mutation::Set {
            key: key(),
            value: ObjectValue::from_value(json!({"a": 1})),
            precondition: Precondition::None,
        };
        let result = mutation
            .apply_to_local_view(None, SnapshotVersion::min())
            .unwrap();
        assert!(result.has_local_mutations());
        assert_eq!(result.version(), SnapshotVersion::min());
    }

    #[test]
    fn patch_updates_only_masked_fields() {
        let mutation = Mutation::Patch {
            key: key(),
            data: ObjectValue::from_value(json!({"a": 2})),
            field_mask: vec![FieldPath::from_dot_separated("a")],
            precondition: Precondition::Exists(true),
        };
        let before = doc(1, json!({"a": 1, "b": "keep"}), DocumentState::Synced);
        let after = mutation
            .apply_to_local_view(Some(before), SnapshotVersion::min())
            .unwrap();
        let after_doc = after.as_document().unwrap();
        assert_eq!(
            after_doc.data.field(&FieldPath::from_dot_separated("a")),
            Some(&json!(2))
        );
        assert_eq!(
            after_doc.data.field(&FieldPath::from_dot_separated("b")),
            Some(&json!("keep"))
        );
    }

    #[test]
    fn patch_with_failed_precondition_is_local_no_op() {
        let mutation = Mutation::Patch {
            key: key(),
            data: ObjectValue::from_value(json!({"a": 2})),
            field_mask: vec![FieldPath::from_dot_separated("a")],
            precondition: Precondition::Exists(true),
        };
        assert!(mutation
            .apply_to_local_view(None, SnapshotVersion::min())
            .is_none());
    }

    #[test]
    fn increment_transform_applies_locally_and_extracts_base() {
        let mutation = Mutation::Transform {
            key: key(),
            field_transforms: vec![FieldTransform {
                field: FieldPath::from_dot_separated("count"),
                transform: TransformOperation::Increment(json!(2)),
            }],
        };
        let before = doc(1, json!({"count": 5}), DocumentState::Synced);
        let base = mutation.extract_base_value(Some(&before)).unwrap();
        assert_eq!(
            base.field(&FieldPath::from_dot_separated("count")),
            Some(&json!(5))
        );
        let after = mutation
            .apply_to_local_view(Some(before), SnapshotVersion::min())
            .unwrap();
        assert_eq!(
            after.as_document().unwrap()
                .data
                .field(&FieldPath::from_dot_separated("count")),
            Some(&json!(7))
        );
    }

    #[test]
    fn array_union_deduplicates() {
        let union = TransformOperation::ArrayUnion(vec![json!(1), json!(2)]);
        let result = union.apply_to_local_view(Some(&json!([2, 3])), SnapshotVersion::min());
        assert_eq!(result, json!([2, 3, 1]));
    }

    #[test]
    fn delete_applies_as_no_document() {
        let mutation = Mutation::Delete {
            key: key(),
            precondition: Precondition::None,
        };
        let before = doc(4, json!({"a": 1}), DocumentState::Synced);
        let after = mutation
            .apply_to_local_view(Some(before), SnapshotVersion::min())
            .unwrap();
        assert!(matches!(after, MaybeDocument::NoDocument(_)));
        assert_eq!(after.version(), SnapshotVersion::min());
    }

    #[test]
    fn acknowledged_set_carries_committed_mutations() {
        let mutation = Mutation::Set {
            key: key(),
            value: ObjectValue::from_value(json!({"a": 1})),
            precondition: Precondition::None,
        };
        let result = MutationResult {
            version: SnapshotVersion::new(10, 0),
            transform_results: None,
        };
        let after = mutation.apply_to_remote_document(None, &result);
        assert!(after.has_committed_mutations());
        assert!(!after.has_local_mutations());
        assert_eq!(after.version(), SnapshotVersion::new(10, 0));
    }

    #[test]
    fn acknowledged_patch_without_base_becomes_unknown() {
        let mutation = Mutation::Patch {
            key: key(),
            data: ObjectValue::from_value(json!({"a": 2})),
            field_mask: vec![FieldPath::from_dot_separated("a")],
            precondition: Precondition::Exists(true),
        };
        let result = MutationResult {
            version: SnapshotVersion::new(10, 0),
            transform_results: None,
        };
        let after = mutation.apply_to_remote_document(None, &result);
        assert!(matches!(after, MaybeDocument::UnknownDocument(_)));
    }
}
