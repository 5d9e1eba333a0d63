use std::fmt;

/// A point in the store's logical time, as reported by the server.
///
/// `min()` is the sentinel for "unknown / never synced": documents created
/// purely by local writes carry it until the server acknowledges them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    seconds: i64,
    nanoseconds: u32,
}

impl SnapshotVersion {
    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    pub fn min() -> Self {
        Self {
            seconds: 0,
            nanoseconds: 0,
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            seconds: micros / 1_000_000,
            nanoseconds: ((micros % 1_000_000) * 1_000) as u32,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + (self.nanoseconds / 1_000) as i64
    }
}

impl fmt::Debug for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SnapshotVersion({}.{:09})",
            self.seconds, self.nanoseconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_before_everything() {
        assert!(SnapshotVersion::min() < SnapshotVersion::new(1, 0));
        assert!(SnapshotVersion::new(1, 0) < SnapshotVersion::new(1, 1));
        assert!(SnapshotVersion::new(1, 999_999_999) < SnapshotVersion::new(2, 0));
    }

    #[test]
    fn micros_round_trip() {
        let version = SnapshotVersion::from_micros(1_500_000_000_123_456);
        assert_eq!(version.to_micros(), 1_500_000_000_123_456);
    }
}
