use std::fmt;

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::resource_path::ResourcePath;

/// Identifies a single document. The wrapped path always has an even
/// number of segments (alternating collection and document ids), which is
/// what distinguishes a document path from a collection path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "Invalid document path ({}): path must point to a document",
                path.canonical_string()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_path_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// The zero-segment key; sorts before every real key, which makes it
    /// useful as a range-scan lower bound.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::empty(),
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The id of the collection this document lives in.
    pub fn collection_id(&self) -> &str {
        self.path.segment(self.path.len() - 2)
    }

    pub fn document_id(&self) -> &str {
        self.path.segment(self.path.len() - 1)
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.pop_last()
    }

    pub fn is_document_path(path: &ResourcePath) -> bool {
        path.len() % 2 == 0
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentKey({})", self.path.canonical_string())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_even_length_paths() {
        let key = DocumentKey::from_path_string("rooms/eros").unwrap();
        assert_eq!(key.collection_id(), "rooms");
        assert_eq!(key.document_id(), "eros");
    }

    #[test]
    fn rejects_collection_paths() {
        assert!(DocumentKey::from_path_string("rooms").is_err());
        assert!(DocumentKey::from_path_string("rooms/eros/messages").is_err());
    }

    #[test]
    fn orders_by_path() {
        let a = DocumentKey::from_path_string("rooms/a").unwrap();
        let b = DocumentKey::from_path_string("rooms/b").unwrap();
        assert!(a < b);
    }
}
