//! Liveness, fragmentation and object-size/peak tracking,
//! grounded on `original_source/include/analysis/memory_liveness.h`'s
//! non-torch subset.
//!
//! Sub-allocation (PyTorch allocator) tracking is excluded: it is tied to a
//! foreign allocator's ABI, not a data-flow or trace concern.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::config::AnalysisType;
use crate::error::Result;
use crate::interval::IntervalSet;
use crate::memory::{Memory, MemoryRange, PSEUDO_BASE};
use crate::operation::{KernelOp, Operation, OperationKind};
use crate::types::ThreadId;

use super::{Analyzer, KernelTraceTable, UnitAccess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperationKind {
    Alloc,
    Set,
    CopyTo,
    CopyFrom,
    Access,
    Free,
}

impl MemoryOperationKind {
    fn as_str(self) -> &'static str {
        match self {
            MemoryOperationKind::Alloc => "ALLOC",
            MemoryOperationKind::Set => "SET",
            MemoryOperationKind::CopyTo => "COPY_TO",
            MemoryOperationKind::CopyFrom => "COPY_FROM",
            MemoryOperationKind::Access => "ACCESS",
            MemoryOperationKind::Free => "FREE",
        }
    }
}

#[derive(Debug)]
struct LivenessTraceInner {
    /// Position in the global alloc/kernel event clock, assigned at
    /// `analysis_begin`.
    order: u64,
    accessed: HashMap<u64, IntervalSet>,
}

impl LivenessTraceInner {
    fn new(order: u64) -> Self {
        Self {
            order,
            accessed: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct ObjectState {
    memory: Arc<Memory>,
    /// Unused-range set, reset to the full object range the first time it
    /// is accessed, then shrunk by subtraction.
    unused: Option<IntervalSet>,
    largest_chunk_cap: Option<u64>,
    freed: bool,
}

impl ObjectState {
    fn new(memory: Arc<Memory>) -> Self {
        Self {
            memory,
            unused: None,
            largest_chunk_cap: None,
            freed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentationRow {
    pub op_id: u64,
    pub largest_chunk: u64,
    pub unused_bytes: u64,
    pub fragmentation: f64,
}

/// Liveness / fragmentation / peak-memory analyzer.
pub struct LivenessAnalyzer {
    objects: Mutex<HashMap<u64, ObjectState>>,
    op_log: Mutex<HashMap<u64, Vec<MemoryOperationKind>>>,
    ctx_table: Mutex<HashMap<i32, Vec<u64>>>,
    /// `(op_id, size)` in allocation order, grounded on the original's
    /// `_memory_size_list` (sorted descending for the size-ranking CSV).
    size_log: Mutex<Vec<(u64, u64)>>,
    current_usage: Mutex<u64>,
    current_peak: Mutex<u64>,
    /// Global alloc/kernel event clock.
    clock: AtomicU64,
    alloc_order: Mutex<HashMap<u64, u64>>,
    last_access_order: Mutex<HashMap<u64, u64>>,
    fragmentation_log: Mutex<Vec<FragmentationRow>>,
    traces: KernelTraceTable<Mutex<LivenessTraceInner>>,
    unresolved_accesses: Mutex<u64>,
}

impl LivenessAnalyzer {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            op_log: Mutex::new(HashMap::new()),
            ctx_table: Mutex::new(HashMap::new()),
            size_log: Mutex::new(Vec::new()),
            current_usage: Mutex::new(0),
            current_peak: Mutex::new(0),
            clock: AtomicU64::new(0),
            alloc_order: Mutex::new(HashMap::new()),
            last_access_order: Mutex::new(HashMap::new()),
            fragmentation_log: Mutex::new(Vec::new()),
            traces: KernelTraceTable::new(),
            unresolved_accesses: Mutex::new(0),
        }
    }

    fn log_op(&self, op: &Operation, kind: MemoryOperationKind) {
        self.op_log.lock().unwrap().entry(op.op_id).or_default().push(kind);
        self.ctx_table.lock().unwrap().entry(op.ctx_id).or_default().push(op.op_id);
    }

    fn on_alloc(&self, op: &Operation, range: MemoryRange) {
        self.log_op(op, MemoryOperationKind::Alloc);
        let memory = Arc::new(Memory::new(op.op_id, op.ctx_id, range));
        let size = range.len();
        self.objects.lock().unwrap().insert(op.op_id, ObjectState::new(memory));
        self.size_log.lock().unwrap().push((op.op_id, size));

        let order = self.clock.fetch_add(1, Ordering::Relaxed);
        self.alloc_order.lock().unwrap().insert(op.op_id, order);

        let mut usage = self.current_usage.lock().unwrap();
        *usage += size;
        let mut peak = self.current_peak.lock().unwrap();
        *peak = (*peak).max(*usage);
    }

    fn on_free(&self, op: &Operation, op_id_hint: u64) {
        self.log_op(op, MemoryOperationKind::Free);
        let size = {
            let mut objects = self.objects.lock().unwrap();
            match objects.get_mut(&op_id_hint) {
                Some(state) if !state.freed => {
                    state.freed = true;
                    Some(state.memory.len())
                }
                _ => None,
            }
        };
        if let Some(size) = size {
            let mut usage = self.current_usage.lock().unwrap();
            *usage = usage.saturating_sub(size);
        }
    }

    /// The optimal peak: max over ops of the sum of sizes of
    /// objects still accessed at or after that op. Modeled as a classic
    /// sweep-line max-overlap: each object contributes a `+size` event at
    /// its allocation order and a `-size` event one past its last observed
    /// access order (or its allocation order, if it was never accessed).
    fn optimal_peak(&self) -> u64 {
        let objects = self.objects.lock().unwrap();
        let alloc_order = self.alloc_order.lock().unwrap();
        let last_access = self.last_access_order.lock().unwrap();

        let mut events: Vec<(u64, i64)> = Vec::with_capacity(objects.len() * 2);
        for (op_id, state) in objects.iter() {
            let start = alloc_order.get(op_id).copied().unwrap_or(0);
            let end = last_access.get(op_id).copied().unwrap_or(start);
            let size = state.memory.len() as i64;
            events.push((start, size));
            events.push((end + 1, -size));
        }
        // Tie-break removals before additions at the same tick, so two
        // objects whose windows merely touch (rather than overlap) don't
        // spuriously sum.
        events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut running = 0i64;
        let mut peak = 0i64;
        for (_, delta) in events {
            running += delta;
            peak = peak.max(running);
        }
        peak.max(0) as u64
    }

    fn size_ranking(&self) -> Vec<(u64, u64)> {
        let mut ranking = self.size_log.lock().unwrap().clone();
        ranking.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranking
    }
}

impl Default for LivenessAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for LivenessAnalyzer {
    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::MemoryLiveness
    }

    fn op_callback(&self, op: &Operation) {
        match &op.kind {
            OperationKind::Memory(mem_op) => self.on_alloc(op, mem_op.range),
            OperationKind::Memset(set) => {
                self.log_op(op, MemoryOperationKind::Set);
                let _ = set;
            }
            OperationKind::Memcpy(cpy) => {
                if cpy.dst_op_id < PSEUDO_BASE {
                    self.log_op(op, MemoryOperationKind::CopyTo);
                } else {
                    self.log_op(op, MemoryOperationKind::CopyFrom);
                }
            }
            OperationKind::Memfree(free) => {
                let objects = self.objects.lock().unwrap();
                let hint = objects
                    .iter()
                    .find(|(_, s)| s.memory.range.start == free.range.start)
                    .map(|(&op_id, _)| op_id);
                drop(objects);
                if let Some(op_id) = hint {
                    self.on_free(op, op_id);
                }
            }
            OperationKind::Kernel(_) => {}
        }
    }

    fn analysis_begin(&self, cpu_thread: u32, kernel_id: u64, _kernel: &KernelOp) {
        let order = self.clock.fetch_add(1, Ordering::Relaxed);
        self.traces
            .get_or_create(cpu_thread, kernel_id, || Mutex::new(LivenessTraceInner::new(order)));
    }

    fn analysis_end(&self, cpu_thread: u32, kernel_id: u64) {
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        let trace = trace.lock().unwrap();
        let mut objects = self.objects.lock().unwrap();
        let mut rows = Vec::new();
        let mut last_access = self.last_access_order.lock().unwrap();

        for (&op_id, ranges) in &trace.accessed {
            last_access
                .entry(op_id)
                .and_modify(|v| *v = (*v).max(trace.order))
                .or_insert(trace.order);
            let Some(state) = objects.get_mut(&op_id) else {
                continue;
            };
            let full = state.memory.range;
            let unused = state.unused.get_or_insert_with(|| {
                let mut set = IntervalSet::new();
                set.insert(full);
                set
            });
            for r in ranges.iter() {
                unused.subtract(r);
            }

            let largest = unused.largest();
            let capped = match state.largest_chunk_cap {
                Some(prev) => largest.min(prev),
                None => largest,
            };
            state.largest_chunk_cap = Some(capped);

            let sum = unused.total_len();
            let fragmentation = if sum == 0 { 0.0 } else { 1.0 - capped as f64 / sum as f64 };
            rows.push(FragmentationRow {
                op_id,
                largest_chunk: capped,
                unused_bytes: sum,
                fragmentation,
            });
        }
        self.fragmentation_log.lock().unwrap().extend(rows);
    }

    fn block_enter(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}
    fn block_exit(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}

    fn unit_access(&self, cpu_thread: u32, kernel_id: u64, access: &UnitAccess) {
        if access.memory.op_id >= PSEUDO_BASE {
            *self.unresolved_accesses.lock().unwrap() += 1;
            return;
        }
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        let unit_bytes = (access.access_kind.unit_size / 8).max(1) as u64;
        let range = MemoryRange::new(access.unit_addr, access.unit_addr + unit_bytes);
        trace
            .lock()
            .unwrap()
            .accessed
            .entry(access.memory.op_id)
            .or_default()
            .insert(range);
    }

    fn flush_thread(&self, cpu_thread: u32, kernel_id: u64) {
        self.traces.remove(cpu_thread, kernel_id);
    }

    fn flush(&self, output_dir: &Path) -> Result<()> {
        if let Err(e) = self.write_liveness_csv(output_dir) {
            warn!("failed to flush memory_liveness.csv: {e}");
        }
        if let Err(e) = self.write_fragmentation_csv(output_dir) {
            warn!("failed to flush memory_fragmentation.csv: {e}");
        }
        Ok(())
    }
}

impl LivenessAnalyzer {
    fn write_liveness_csv(&self, output_dir: &Path) -> IoResult<()> {
        let path = output_dir.join("memory_liveness.csv");
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "op_id,size,operations")?;
        let op_log = self.op_log.lock().unwrap();
        for (op_id, size) in self.size_ranking() {
            let ops = op_log
                .get(&op_id)
                .map(|kinds| kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(";"))
                .unwrap_or_default();
            writeln!(out, "{op_id},{size},{ops}")?;
        }
        writeln!(
            out,
            "# current_peak={},optimal_peak={},unresolved_accesses={}",
            *self.current_peak.lock().unwrap(),
            self.optimal_peak(),
            *self.unresolved_accesses.lock().unwrap()
        )?;

        let ctx_table = self.ctx_table.lock().unwrap();
        let mut ctx_ids: Vec<i32> = ctx_table.keys().copied().collect();
        ctx_ids.sort_unstable();
        for ctx_id in ctx_ids {
            let op_ids = ctx_table[&ctx_id].iter().map(u64::to_string).collect::<Vec<_>>().join(";");
            writeln!(out, "# ctx={ctx_id},ops={op_ids}")?;
        }
        Ok(())
    }

    fn write_fragmentation_csv(&self, output_dir: &Path) -> IoResult<()> {
        let path = output_dir.join("memory_fragmentation.csv");
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "op_id,largest_chunk,unused_bytes,fragmentation")?;
        for row in self.fragmentation_log.lock().unwrap().iter() {
            writeln!(out, "{},{},{},{}", row.op_id, row.largest_chunk, row.unused_bytes, row.fragmentation)?;
        }
        Ok(())
    }
}
