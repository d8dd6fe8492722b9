//! Analyzer framework: the `Analyzer` trait with
//! its three life-cycle phases, the per-(cpu_thread, kernel_id) `Trace`
//! table, and the shared `UnitAccess` record analyzers are fed.
//!
//! Grounded on `original_source/include/analysis/analysis.h`'s abstract
//! base (`op_callback`, `analysis_begin`/`_end`, `block_enter`/`_exit`,
//! `unit_access`, `flush_thread`/`flush`).

mod dispatcher;
pub mod data_flow;
pub mod heatmap;
pub mod liveness;
pub mod spatial_redundancy;
pub mod temporal_redundancy;
pub mod value_pattern;

pub use dispatcher::{Dispatcher, RecordKind};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::binary::AccessKind;
use crate::error::Result;
use crate::memory::Memory;
use crate::operation::KernelOp;
use crate::types::ThreadId;

/// One decoded unit within a vector access, resolved and fanned out by the
/// ingestion dispatcher.
#[derive(Debug, Clone)]
pub struct UnitAccess {
    pub kernel_id: u64,
    pub thread_id: ThreadId,
    pub access_kind: AccessKind,
    pub memory: Arc<Memory>,
    pub pc: u64,
    pub value: u64,
    pub is_read: bool,
    pub unit_addr: u64,
    pub index: u32,
}

/// Per-(cpu_thread, kernel_id) analyzer-owned state. Analyzers define their own concrete trace type; this marker
/// trait only requires it be shareable across the table and flush.
pub trait Trace: Send + Sync + std::fmt::Debug {}

/// `(cpu_thread, kernel_id) -> Arc<T>`, created on `analysis_begin` and
/// removed on `flush_thread`. Each analyzer owns one,
/// parametrized by its own trace type.
#[derive(Debug)]
pub struct KernelTraceTable<T> {
    inner: Mutex<HashMap<(u32, u64), Arc<T>>>,
}

impl<T> Default for KernelTraceTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> KernelTraceTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, cpu_thread: u32, kernel_id: u64, make: impl FnOnce() -> T) -> Arc<T> {
        let mut guard = self.inner.lock().unwrap();
        guard
            .entry((cpu_thread, kernel_id))
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    pub fn get(&self, cpu_thread: u32, kernel_id: u64) -> Option<Arc<T>> {
        self.inner.lock().unwrap().get(&(cpu_thread, kernel_id)).cloned()
    }

    pub fn remove(&self, cpu_thread: u32, kernel_id: u64) -> Option<Arc<T>> {
        self.inner.lock().unwrap().remove(&(cpu_thread, kernel_id))
    }

    /// Snapshot of all live entries, for flush (which aggregates across
    /// every CPU thread and kernel that has not yet been individually
    /// flushed via `flush_thread`).
    pub fn snapshot(&self) -> Vec<((u32, u64), Arc<T>)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Abstract analyzer. Every method is
/// non-blocking on the hot path (`unit_access`, `block_enter/exit`);
/// `flush`/`flush_thread` may block briefly on shared aggregates.
pub trait Analyzer: Send + Sync {
    fn analysis_type(&self) -> crate::config::AnalysisType;

    /// Coarse-grained operation callback: kernel launches, allocations,
    /// copies, sets, frees. Most analyzers other than data-flow and
    /// liveness ignore this.
    fn op_callback(&self, _op: &crate::operation::Operation) {}

    /// Ensures a `Trace` exists for (cpu_thread, kernel_id).
    fn analysis_begin(&self, cpu_thread: u32, kernel_id: u64, kernel: &KernelOp);

    /// Finalizes in-flight per-kernel state; does not remove the trace
    /// (removal happens at `flush_thread`.2).
    fn analysis_end(&self, cpu_thread: u32, kernel_id: u64);

    fn block_enter(&self, cpu_thread: u32, kernel_id: u64, thread: ThreadId);
    fn block_exit(&self, cpu_thread: u32, kernel_id: u64, thread: ThreadId);

    fn unit_access(&self, cpu_thread: u32, kernel_id: u64, access: &UnitAccess);

    /// Reduces and emits one (cpu_thread, kernel_id) trace, then removes
    /// it from this analyzer's `KernelTraceTable`.
    fn flush_thread(&self, cpu_thread: u32, kernel_id: u64);

    /// Reduces and emits whatever cross-kernel aggregate this analyzer
    /// keeps (data-flow graph, liveness log, heatmap). I/O failures are
    /// logged, not propagated as a process abort.
    fn flush(&self, output_dir: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy(u32);
    impl Trace for Dummy {}

    #[test]
    fn get_or_create_is_idempotent_per_key() {
        let table: KernelTraceTable<Dummy> = KernelTraceTable::new();
        let a = table.get_or_create(1, 100, || Dummy(1));
        let b = table.get_or_create(1, 100, || Dummy(2));
        assert_eq!(a.0, 1);
        assert_eq!(b.0, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_drops_the_entry() {
        let table: KernelTraceTable<Dummy> = KernelTraceTable::new();
        table.get_or_create(1, 100, || Dummy(1));
        assert!(table.remove(1, 100).is_some());
        assert!(table.is_empty());
    }
}
