//! Ordered set of disjoint half-open intervals with the three-phase merge
//! primitive, grounded on
//! `original_source/src/analysis/data_flow.cpp` `merge_memory_range`.

use std::collections::BTreeMap;

use crate::memory::MemoryRange;

/// Keyed by interval start, so `prev()` (the largest start `<=` a probe) is
/// an O(log n) `BTreeMap::range` lookup.
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    intervals: BTreeMap<u64, u64>, // start -> end
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryRange> + '_ {
        self.intervals
            .iter()
            .map(|(&start, &end)| MemoryRange::new(start, end))
    }

    pub fn total_len(&self) -> u64 {
        self.intervals.values().zip(self.intervals.keys()).map(|(&e, &s)| e - s).sum()
    }

    pub fn largest(&self) -> u64 {
        self.intervals
            .iter()
            .map(|(&s, &e)| e - s)
            .max()
            .unwrap_or(0)
    }

    fn prev_entry(&self, start: u64) -> Option<(u64, u64)> {
        self.intervals
            .range(..=start)
            .next_back()
            .map(|(&s, &e)| (s, e))
    }

    /// Three-phase merge: absorb a predecessor overlapping/covering the new
    /// interval, then repeatedly absorb successors, then insert the
    /// resulting interval.
    pub fn insert(&mut self, range: MemoryRange) {
        let (mut start, mut end) = (range.start, range.end);
        if start >= end {
            return;
        }

        if let Some((pstart, pend)) = self.prev_entry(start) {
            if pend >= start {
                start = pstart;
                end = end.max(pend);
                self.intervals.remove(&pstart);
            }
        }

        loop {
            let next = self
                .intervals
                .range(start..)
                .next()
                .map(|(&s, &e)| (s, e));
            match next {
                Some((nstart, nend)) if nstart <= end => {
                    end = end.max(nend);
                    self.intervals.remove(&nstart);
                }
                _ => break,
            }
        }

        self.intervals.insert(start, end);
    }

    /// `self` minus `range`, splitting/truncating intervals as needed
    /// (used by fragmentation's `unused_ranges` subtraction).
    pub fn subtract(&mut self, range: MemoryRange) {
        let (start, end) = (range.start, range.end);
        if start >= end {
            return;
        }
        let affected: Vec<(u64, u64)> = self
            .intervals
            .range(..)
            .filter(|&(&s, &e)| s < end && start < e)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in affected {
            self.intervals.remove(&s);
            if s < start {
                self.intervals.insert(s, start.min(e));
            }
            if e > end {
                self.intervals.insert(end.max(s), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorbs_overlapping_predecessor_and_successor() {
        let mut set = IntervalSet::new();
        set.insert(MemoryRange::new(0, 10));
        set.insert(MemoryRange::new(20, 30));
        set.insert(MemoryRange::new(5, 25)); // bridges both
        let merged: Vec<_> = set.iter().collect();
        assert_eq!(merged, vec![MemoryRange::new(0, 30)]);
    }

    #[test]
    fn disjoint_intervals_stay_separate() {
        let mut set = IntervalSet::new();
        set.insert(MemoryRange::new(0, 10));
        set.insert(MemoryRange::new(20, 30));
        let merged: Vec<_> = set.iter().collect();
        assert_eq!(merged, vec![MemoryRange::new(0, 10), MemoryRange::new(20, 30)]);
    }

    #[test]
    fn adjacent_intervals_merge() {
        let mut set = IntervalSet::new();
        set.insert(MemoryRange::new(0, 10));
        set.insert(MemoryRange::new(10, 20));
        let merged: Vec<_> = set.iter().collect();
        assert_eq!(merged, vec![MemoryRange::new(0, 20)]);
    }

    #[test]
    fn fragmentation_scenario_s4() {
        // S4: object len=100, K1 accesses [0,30) and [60,100).
        let mut accessed = IntervalSet::new();
        accessed.insert(MemoryRange::new(0, 30));
        accessed.insert(MemoryRange::new(60, 100));

        let mut unused = IntervalSet::new();
        unused.insert(MemoryRange::new(0, 100));
        for r in accessed.iter() {
            unused.subtract(r);
        }
        let remaining: Vec<_> = unused.iter().collect();
        assert_eq!(remaining, vec![MemoryRange::new(30, 60)]);
        assert_eq!(unused.total_len(), 30);
        assert_eq!(unused.largest(), 30);
    }

    #[test]
    fn fragmentation_scenario_s4_second_kernel() {
        let mut unused = IntervalSet::new();
        unused.insert(MemoryRange::new(30, 60));
        unused.subtract(MemoryRange::new(40, 50));
        let remaining: Vec<_> = unused.iter().collect();
        assert_eq!(remaining, vec![MemoryRange::new(30, 40), MemoryRange::new(50, 60)]);
        assert_eq!(unused.total_len(), 20);
        assert_eq!(unused.largest(), 10);
    }

    #[test]
    fn subtract_splits_interval_in_the_middle() {
        let mut set = IntervalSet::new();
        set.insert(MemoryRange::new(0, 100));
        set.subtract(MemoryRange::new(40, 50));
        let remaining: Vec<_> = set.iter().collect();
        assert_eq!(remaining, vec![MemoryRange::new(0, 40), MemoryRange::new(50, 100)]);
    }
}
