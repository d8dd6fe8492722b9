use std::collections::HashMap;
use std::sync::Mutex;

/// op_id → last-writer ctx_id. Used by the data-flow analyzer to chain a
/// memcpy/memset/kernel operation back to whichever prior operation wrote
/// the bytes it is about to read.
#[derive(Default)]
pub struct OpNodeTable {
    inner: Mutex<HashMap<u64, i32>>,
}

impl OpNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_writer(&self, op_id: u64, ctx_id: i32) {
        self.inner.lock().unwrap().insert(op_id, ctx_id);
    }

    pub fn writer(&self, op_id: u64) -> Option<i32> {
        self.inner.lock().unwrap().get(&op_id).copied()
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

    #[test]
    fn last_writer_wins() {
        let table = OpNodeTable::new();
        table.set_writer(1, 10);
        table.set_writer(1, 20);
        assert_eq!(table.writer(1), Some(20));
    }

    #[test]
    fn unknown_op_id_is_none() {
        let table = OpNodeTable::new();
        assert_eq!(table.writer(99), None);
    }
}
