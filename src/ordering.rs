use dashmap::DashMap;

#[derive(Debug, PartialEq, Eq)]
pub enum SnapshotDecision {
    Forward,
    /// Newer than the last forwarded snapshot but some were never seen.
    /// Snapshots are whole, so it is still forwarded.
    ForwardAfterGap { expected: u64, got: u64 },
    DropStale { last: u64 },
}

/// Per-device watermark of the last `query-sync` sequence forwarded to dashboards.
#[derive(Debug, Default)]
pub struct SnapshotOrdering {
    last_forwarded: DashMap<String, u64>,
}

impl SnapshotOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, device_id: &str, sequence: u64) -> SnapshotDecision {
        let mut last = match self.last_forwarded.get_mut(device_id) {
            Some(last) => last,
            None => {
                // First snapshot since (re)connect sets the baseline.
                self.last_forwarded.insert(device_id.to_string(), sequence);
                return SnapshotDecision::Forward;
            }
        };

        if sequence <= *last {
            return SnapshotDecision::DropStale { last: *last };
        }

        let expected = *last + 1;
        *last = sequence;

        if sequence != expected {
            SnapshotDecision::ForwardAfterGap {
                expected,
                got: sequence,
            }
        } else {
            SnapshotDecision::Forward
        }
    }

    pub fn last(&self, device_id: &str) -> Option<u64> {
        self.last_forwarded.get(device_id).map(|last| *last)
    }

    /// Forgets the watermark so a restarted device is re-baselined.
    pub fn reset(&self, device_id: &str) {
        self.last_forwarded.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_snapshots_forward() {
        let ordering = SnapshotOrdering::new();
        assert_eq!(ordering.classify("dev-A", 1), SnapshotDecision::Forward);
        assert_eq!(ordering.classify("dev-A", 2), SnapshotDecision::Forward);
        assert_eq!(ordering.classify("dev-A", 3), SnapshotDecision::Forward);
        assert_eq!(ordering.last("dev-A"), Some(3));
    }

    #[test]
    fn late_snapshot_is_dropped() {
        let ordering = SnapshotOrdering::new();
        assert_eq!(ordering.classify("dev-A", 4), SnapshotDecision::Forward);
        assert_eq!(
            ordering.classify("dev-A", 3),
            SnapshotDecision::DropStale { last: 4 }
        );
        assert_eq!(
            ordering.classify("dev-A", 4),
            SnapshotDecision::DropStale { last: 4 }
        );
    }

    #[test]
    fn gap_still_forwards_and_advances() {
        let ordering = SnapshotOrdering::new();
        assert_eq!(ordering.classify("dev-A", 1), SnapshotDecision::Forward);
        assert_eq!(
            ordering.classify("dev-A", 5),
            SnapshotDecision::ForwardAfterGap {
                expected: 2,
                got: 5
            }
        );
        assert_eq!(ordering.last("dev-A"), Some(5));
    }

    #[test]
    fn devices_are_tracked_independently() {
        let ordering = SnapshotOrdering::new();
        assert_eq!(ordering.classify("dev-A", 9), SnapshotDecision::Forward);
        assert_eq!(ordering.classify("dev-B", 1), SnapshotDecision::Forward);
        assert_eq!(ordering.last("dev-B"), Some(1));
    }

    #[test]
    fn reset_rebaselines_restarted_device() {
        let ordering = SnapshotOrdering::new();
        assert_eq!(ordering.classify("dev-A", 40), SnapshotDecision::Forward);
        ordering.reset("dev-A");
        assert_eq!(ordering.last("dev-A"), None);
        assert_eq!(ordering.classify("dev-A", 1), SnapshotDecision::Forward);
    }
}
