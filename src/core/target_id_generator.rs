use crate::model::collections::TargetId;

/// Hands out target ids from one of two disjoint, interleaved ranges.
///
/// The target cache assigns even ids to user queries; the sync engine
/// assigns odd ids to limbo-resolution targets. Keeping the ranges
/// disjoint means a limbo target can never collide with a query target.
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { next_id: 2 }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_disjoint() {
        let mut cache = TargetIdGenerator::for_target_cache();
        let mut engine = TargetIdGenerator::for_sync_engine();
        assert_eq!(cache.next(), 2);
        assert_eq!(cache.next(), 4);
        assert_eq!(engine.next(), 1);
        assert_eq!(engine.next(), 3);
    }
}
