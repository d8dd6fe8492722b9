use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{RedshowError, Result};
use crate::memory::Memory;

/// Ordered sequence of `(MemoryRange, Memory)` keyed by range start.
/// `prev(addr)` finds the entry whose range might contain `addr` in
/// O(log n). Invariant: ranges are disjoint while live.
#[derive(Default)]
pub struct MemoryTable {
    inner: Mutex<BTreeMap<u64, Arc<Memory>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, memory: Memory) -> Result<Arc<Memory>> {
        let mut guard = self.inner.lock().unwrap();
        let range = memory.range;
        if let Some((_, prev)) = guard.range(..=range.start).next_back() {
            if prev.range.overlaps(&range) {
                return Err(RedshowError::Duplicate(format!(
                    "memory range [{}, {}) overlaps existing [{}, {})",
                    range.start, range.end, prev.range.start, prev.range.end
                )));
            }
        }
        if let Some((_, next)) = guard.range(range.start..).next() {
            if next.range.overlaps(&range) {
                return Err(RedshowError::Duplicate(format!(
                    "memory range [{}, {}) overlaps existing [{}, {})",
                    range.start, range.end, next.range.start, next.range.end
                )));
            }
        }
        let arc = Arc::new(memory);
        guard.insert(range.start, arc.clone());
        Ok(arc)
    }

    pub fn unregister(&self, start: u64) -> Result<Arc<Memory>> {
        self.inner
            .lock()
            .unwrap()
            .remove(&start)
            .ok_or_else(|| RedshowError::NotFound(format!("memory start={start}")))
    }

    /// Returns the live object whose range might contain `addr`: the entry
    /// with the largest `start <= addr`. Caller must check
    /// `MemoryRange::contains` since `addr` may fall past that object's end.
    pub fn prev(&self, addr: u64) -> Option<Arc<Memory>> {
        self.inner
            .lock()
            .unwrap()
            .range(..=addr)
            .next_back()
            .map(|(_, mem)| mem.clone())
    }

    /// Resolves `addr` to the live object actually containing it, if any.
    pub fn find(&self, addr: u64) -> Option<Arc<Memory>> {
        self.prev(addr).filter(|m| m.range.contains(addr))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRange;

    #[test]
    fn prev_returns_largest_start_leq_addr() {
        let table = MemoryTable::new();
        table.register(Memory::new(1, 1, MemoryRange::new(0, 100))).unwrap();
        table.register(Memory::new(2, 2, MemoryRange::new(200, 300))).unwrap();

        assert_eq!(table.prev(50).unwrap().op_id, 1);
        assert_eq!(table.prev(250).unwrap().op_id, 2);
        assert!(table.find(150).is_none());
    }

    #[test]
    fn end_boundary_address_belongs_to_next_object() {
        let table = MemoryTable::new();
        table.register(Memory::new(1, 1, MemoryRange::new(0, 100))).unwrap();
        table.register(Memory::new(2, 2, MemoryRange::new(100, 200))).unwrap();
        assert_eq!(table.find(100).unwrap().op_id, 2);
    }

    #[test]
    fn overlapping_insert_fails_with_duplicate() {
        let table = MemoryTable::new();
        table.register(Memory::new(1, 1, MemoryRange::new(0, 100))).unwrap();
        let err = table
            .register(Memory::new(2, 2, MemoryRange::new(50, 150)))
            .unwrap_err();
        assert!(matches!(err, RedshowError::Duplicate(_)));
    }

    #[test]
    fn register_then_unregister_round_trips() {
        let table = MemoryTable::new();
        table.register(Memory::new(1, 1, MemoryRange::new(0, 100))).unwrap();
        table.unregister(0).unwrap();
        assert!(table.is_empty());
    }
}
