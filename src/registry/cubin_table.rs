use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::binary::Cubin;
use crate::error::{RedshowError, Result};

/// cubin_id → Cubin. Register fails with `Duplicate` when the id already
/// exists; unregister fails with `NotFound`.
#[derive(Default)]
pub struct CubinTable {
    inner: Mutex<HashMap<u32, Arc<Cubin>>>,
}

impl CubinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cubin_id: u32, cubin: Cubin) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.contains_key(&cubin_id) {
            return Err(RedshowError::Duplicate(format!("cubin_id={cubin_id}")));
        }
        guard.insert(cubin_id, Arc::new(cubin));
        Ok(())
    }

    pub fn unregister(&self, cubin_id: u32) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard
            .remove(&cubin_id)
            .map(|_| ())
            .ok_or_else(|| RedshowError::NotFound(format!("cubin_id={cubin_id}")))
    }

    pub fn get(&self, cubin_id: u32) -> Option<Arc<Cubin>> {
        self.inner.lock().unwrap().get(&cubin_id).cloned()
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
    use std::path::PathBuf;

    fn dummy_cubin(id: u32) -> Cubin {
        Cubin::empty_for_test(id, PathBuf::from(format!("/tmp/fake-{id}.json")))
    }

    #[test]
    fn duplicate_register_fails() {
        let table = CubinTable::new();
        table.register(1, dummy_cubin(1)).unwrap();
        let err = table.register(1, dummy_cubin(1)).unwrap_err();
        assert!(matches!(err, RedshowError::Duplicate(_)));
    }

    #[test]
    fn register_then_unregister_round_trips_to_empty() {
        let table = CubinTable::new();
        table.register(1, dummy_cubin(1)).unwrap();
        assert_eq!(table.len(), 1);
        table.unregister(1).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn unregister_missing_is_not_found() {
        let table = CubinTable::new();
        let err = table.unregister(99).unwrap_err();
        assert!(matches!(err, RedshowError::NotFound(_)));
    }
}
