//! Received byte ranges of an upload session
//!
//! Half-open `[start, end)` ranges kept sorted, non-overlapping and coalesced.
//! Insertion is commutative, so chunk arrival order never matters.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True when `range` is already fully covered
    pub fn contains(&self, range: &Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.end)
    }

    /// Union `range` into the set, merging touching and overlapping neighbours
    pub fn insert(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let mut start = range.start;
        let mut end = range.end;

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        let absorbed: Vec<u64> = self
            .ranges
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }

        self.ranges.insert(start, end);
    }

    /// Total bytes covered
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Highest covered offset (exclusive), 0 when empty
    pub fn high_water_mark(&self) -> u64 {
        self.ranges.values().next_back().copied().unwrap_or(0)
    }

    /// True when the set is exactly `[0, total)`
    pub fn is_complete(&self, total: u64) -> bool {
        if total == 0 {
            return true;
        }
        self.ranges.len() == 1 && self.ranges.get(&0) == Some(&total)
    }

    /// Gaps within `[0, total)`
    pub fn missing(&self, total: u64) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for (&start, &end) in &self.ranges {
            if start >= total {
                break;
            }
            if start > cursor {
                gaps.push(cursor..start);
            }
            cursor = cursor.max(end);
        }
        if cursor < total {
            gaps.push(cursor..total);
        }
        gaps
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }
}

impl Serialize for RangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<[u64; 2]> = self.ranges.iter().map(|(&s, &e)| [s, e]).collect();
        pairs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RangeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<[u64; 2]>::deserialize(deserializer)?;
        let mut set = RangeSet::new();
        for [start, end] in pairs {
            if start > end {
                return Err(serde::de::Error::custom(format!(
                    "invalid range [{start}, {end})"
                )));
            }
            set.insert(start..end);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesces_adjacent_ranges() {
        let mut set = RangeSet::new();
        set.insert(0..400);
        set.insert(400..1000);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..1000]);
        assert!(set.is_complete(1000));
    }

    #[test]
    fn test_order_independent() {
        let mut forward = RangeSet::new();
        let mut backward = RangeSet::new();
        let chunks = [0..100, 100..250, 250..300, 300..512];

        for c in chunks.iter().cloned() {
            forward.insert(c);
        }
        for c in chunks.iter().rev().cloned() {
            backward.insert(c);
        }

        assert_eq!(forward, backward);
        assert_eq!(forward.covered_bytes(), 512);
    }

    #[test]
    fn test_replay_is_noop() {
        let mut set = RangeSet::new();
        set.insert(100..200);
        assert!(set.contains(&(100..200)));
        assert!(set.contains(&(120..180)));
        assert!(!set.contains(&(150..250)));

        let before = set.clone();
        set.insert(100..200);
        assert_eq!(set, before);
    }

    #[test]
    fn test_overlap_bridges_gaps() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        set.insert(20..30);
        set.insert(40..50);
        set.insert(5..45);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..50]);
    }

    #[test]
    fn test_missing_ranges() {
        let mut set = RangeSet::new();
        set.insert(100..200);
        set.insert(300..400);
        assert_eq!(set.missing(500), vec![0..100, 200..300, 400..500]);
        assert_eq!(set.high_water_mark(), 400);
        assert!(!set.is_complete(500));
    }

    #[test]
    fn test_json_shape() {
        let mut set = RangeSet::new();
        set.insert(400..1000);
        set.insert(0..100);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[[0,100],[400,1000]]");

        let back: RangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert!(serde_json::from_str::<RangeSet>("[[10,5]]").is_err());
    }
}
