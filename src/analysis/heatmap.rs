//! Per-object access-count heatmap, grounded on
//! `original_source/include/analysis/memory_heatmap.h` /
//! `src/analysis/memory_heatmap.cpp`'s `HeatMapMemory{size, array}` and
//! `update_heatmap_list`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::Path;
use std::sync::Mutex;

use log::warn;

use crate::config::AnalysisType;
use crate::error::Result;
use crate::memory::{Memory, MemoryRange, PSEUDO_BASE};
use crate::operation::{KernelOp, Operation, OperationKind};
use crate::types::ThreadId;

use super::{Analyzer, UnitAccess};

/// One counter per `unit_size`-sized slot in the object
/// (`object_len / unit_size` counters total).
#[derive(Debug, Clone)]
struct HeatMapMemory {
    base: u64,
    unit_size: u64,
    counters: Vec<u64>,
}

impl HeatMapMemory {
    fn new(range: MemoryRange, unit_size: u64) -> Self {
        let unit_size = unit_size.max(1);
        let len = (range.len() / unit_size).max(1) as usize;
        Self {
            base: range.start,
            unit_size,
            counters: vec![0; len],
        }
    }

    /// Increments every counter spanning `[range.start, range.end)`
    ////unit_size` up to
    /// `(range.end-base)/unit_size`).
    fn record(&mut self, range: MemoryRange) {
        let start = ((range.start.saturating_sub(self.base)) / self.unit_size) as usize;
        let end = ((range.end.saturating_sub(self.base)).div_ceil(self.unit_size)) as usize;
        let end = end.min(self.counters.len());
        for counter in &mut self.counters[start.min(end)..end] {
            *counter += 1;
        }
    }
}

/// Per-object hit-count heatmap analyzer.
pub struct HeatmapAnalyzer {
    memories: Mutex<HashMap<u64, Memory>>,
    heatmaps: Mutex<HashMap<u64, HeatMapMemory>>,
    total_access: Mutex<u64>,
}

impl HeatmapAnalyzer {
    pub fn new() -> Self {
        Self {
            memories: Mutex::new(HashMap::new()),
            heatmaps: Mutex::new(HashMap::new()),
            total_access: Mutex::new(0),
        }
    }
}

impl Default for HeatmapAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for HeatmapAnalyzer {
    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::MemoryHeatmap
    }

    fn op_callback(&self, op: &Operation) {
        if let OperationKind::Memory(mem_op) = &op.kind {
            self.memories
                .lock()
                .unwrap()
                .insert(op.op_id, Memory::new(op.op_id, op.ctx_id, mem_op.range));
        }
    }

    fn analysis_begin(&self, _cpu_thread: u32, _kernel_id: u64, _kernel: &KernelOp) {}
    fn analysis_end(&self, _cpu_thread: u32, _kernel_id: u64) {}
    fn block_enter(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}
    fn block_exit(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}

    fn unit_access(&self, _cpu_thread: u32, _kernel_id: u64, access: &UnitAccess) {
        if access.memory.op_id >= PSEUDO_BASE {
            return;
        }
        *self.total_access.lock().unwrap() += 1;

        let unit_bytes = (access.access_kind.unit_size / 8).max(1) as u64;
        let range = MemoryRange::new(access.unit_addr, access.unit_addr + unit_bytes);

        let mut heatmaps = self.heatmaps.lock().unwrap();
        let heatmap = heatmaps.entry(access.memory.op_id).or_insert_with(|| {
            let memories = self.memories.lock().unwrap();
            let base_range = memories
                .get(&access.memory.op_id)
                .map_or(access.memory.range, |m| m.range);
            HeatMapMemory::new(base_range, unit_bytes)
        });
        heatmap.record(range);
    }

    fn flush_thread(&self, _cpu_thread: u32, _kernel_id: u64) {}

    fn flush(&self, output_dir: &Path) -> Result<()> {
        if let Err(e) = self.write_csv(output_dir) {
            warn!("failed to flush memory_heatmap.csv: {e}");
        }
        Ok(())
    }
}

impl HeatmapAnalyzer {
    fn write_csv(&self, output_dir: &Path) -> IoResult<()> {
        let path = output_dir.join("memory_heatmap.csv");
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "op_id,slot,count")?;
        let heatmaps = self.heatmaps.lock().unwrap();
        let mut op_ids: Vec<&u64> = heatmaps.keys().collect();
        op_ids.sort_unstable();
        for &op_id in op_ids {
            let heatmap = &heatmaps[op_id];
            for (slot, count) in heatmap.counters.iter().enumerate() {
                if *count > 0 {
                    writeln!(out, "{op_id},{slot},{count}")?;
                }
            }
        }
        writeln!(out, "# total_access={}", *self.total_access.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{AccessKind, DataType};
    use std::sync::Arc;

    fn access(addr: u64) -> UnitAccess {
        UnitAccess {
            kernel_id: 1,
            thread_id: ThreadId::new((0, 0, 0), (0, 0, 0)),
            access_kind: AccessKind::new(DataType::Int, 32, 32),
            memory: Arc::new(Memory::new(1, 1, MemoryRange::new(0, 100))),
            pc: 0,
            value: 0,
            is_read: false,
            unit_addr: addr,
            index: 0,
        }
    }

    #[test]
    fn records_one_hit_per_unit_touched() {
        let analyzer = HeatmapAnalyzer::new();
        analyzer.op_callback(&Operation::new(1, 1, OperationKind::Memory(crate::operation::MemoryOp { range: MemoryRange::new(0, 100) })));
        analyzer.unit_access(0, 1, &access(0));
        analyzer.unit_access(0, 1, &access(0));
        analyzer.unit_access(0, 1, &access(4));

        let heatmaps = analyzer.heatmaps.lock().unwrap();
        let heatmap = &heatmaps[&1];
        assert_eq!(heatmap.counters[0], 2);
        assert_eq!(heatmap.counters[1], 1);
    }

    #[test]
    fn pseudo_memory_is_skipped() {
        let analyzer = HeatmapAnalyzer::new();
        let mut pseudo_access = access(0);
        pseudo_access.memory = Arc::new(Memory::new(crate::memory::HOST_ID, 0, MemoryRange::new(0, 8)));
        analyzer.unit_access(0, 1, &pseudo_access);
        assert!(analyzer.heatmaps.lock().unwrap().is_empty());
        assert_eq!(*analyzer.total_access.lock().unwrap(), 0);
    }
}
