use std::cmp::Ordering;

use crate::util::sorted_map::{Comparator, SortedMap, SortedMapIter};

/// An immutable, persistent ordered set built on [`SortedMap`].
///
/// Like the map, every mutation returns a new set sharing structure with
/// the old one; document key sets and target-id sets are passed around the
/// engine by cheap clones of these.
pub struct SortedSet<T> {
    map: SortedMap<T, ()>,
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T: Ord + Clone + 'static> SortedSet<T> {
    pub fn new() -> Self {
        Self {
            map: SortedMap::new(),
        }
    }
}

impl<T: Ord + Clone + 'static> Default for SortedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SortedSet<T> {
    pub fn with_comparator(comparator: Comparator<T>) -> Self {
        Self {
            map: SortedMap::with_comparator(comparator),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.map.contains_key(value)
    }

    pub fn insert(&self, value: T) -> Self {
        Self {
            map: self.map.insert(value, ()),
        }
    }

    pub fn remove(&self, value: &T) -> Self {
        Self {
            map: self.map.remove(value),
        }
    }

    pub fn first(&self) -> Option<&T> {
        self.map.min_key()
    }

    pub fn last(&self) -> Option<&T> {
        self.map.max_key()
    }

    pub fn index_of(&self, value: &T) -> usize {
        self.map.index_of(value)
    }

    pub fn iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.map.iter(),
        }
    }

    pub fn iter_from<'a>(&'a self, from: &'a T) -> SortedSetIter<'a, T> {
        SortedSetIter {
            inner: self.map.iter_from(from),
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for value in other.iter() {
            result = result.insert(value.clone());
        }
        result
    }
}

impl<T: Clone> SortedSet<T> {
    /// Structural equality under this set's ordering.
    pub fn equals(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let comparator = self.map.comparator();
        self.iter()
            .zip(other.iter())
            .all(|(a, b)| comparator(a, b) == Ordering::Equal)
    }
}

impl<T: Clone> FromIterator<T> for SortedSet<T>
where
    T: Ord + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = SortedSet::new();
        for value in iter {
            set = set.insert(value);
        }
        set
    }
}

pub struct SortedSetIter<'a, T> {
    inner: SortedMapIter<'a, T, ()>,
}

impl<'a, T> Iterator for SortedSetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

impl<T: std::fmt::Debug + Clone> std::fmt::Debug for SortedSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let set: SortedSet<i32> = SortedSet::new();
        let set = set.insert(2).insert(1).insert(3);
        assert!(set.contains(&2));
        let set = set.remove(&2);
        assert!(!set.contains(&2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn iterates_in_order() {
        let set: SortedSet<i32> = [5, 1, 4, 2, 3].into_iter().collect();
        let values: Vec<i32> = set.iter().copied().collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(set.first(), Some(&1));
        assert_eq!(set.last(), Some(&5));
    }

    #[test]
    fn union_merges_both_sides() {
        let a: SortedSet<i32> = [1, 3].into_iter().collect();
        let b: SortedSet<i32> = [2, 3, 4].into_iter().collect();
        let merged = a.union(&b);
        let values: Vec<i32> = merged.iter().copied().collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }
}
