//! Temporal redundancy analyzer, grounded on
//! `original_source/src/analysis/temporal_redundancy.cpp`.
//!
//! Detects repeated writes (or reads) of the same value to the same
//! address from a different pc within the same thread block, and
//! accumulates a per-pc PC-pair histogram.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::binary::AccessKind;
use crate::config::AnalysisType;
use crate::error::Result;
use crate::operation::KernelOp;
use crate::registry::CubinTable;
use crate::types::ThreadId;

use super::{Analyzer, KernelTraceTable, UnitAccess};

#[derive(Debug, Default, Clone)]
struct ThreadAddrState {
    // addr -> (last_pc, last_value)
    writes: HashMap<u64, (u64, u64)>,
    reads: HashMap<u64, (u64, u64)>,
}

type PcPairHistogram = HashMap<u64, HashMap<u64, HashMap<(u64, AccessKind), u64>>>;

#[derive(Debug)]
struct TemporalTraceInner {
    kernel: KernelOp,
    thread_state: HashMap<ThreadId, ThreadAddrState>,
    pc_pairs_write: PcPairHistogram,
    pc_pairs_read: PcPairHistogram,
    access_count_write: HashMap<u64, u64>,
    access_count_read: HashMap<u64, u64>,
}

impl TemporalTraceInner {
    fn new(kernel: KernelOp) -> Self {
        Self {
            kernel,
            thread_state: HashMap::new(),
            pc_pairs_write: HashMap::new(),
            pc_pairs_read: HashMap::new(),
            access_count_write: HashMap::new(),
            access_count_read: HashMap::new(),
        }
    }

    fn record_access(&mut self, thread_id: ThreadId, addr: u64, pc: u64, value: u64, access_kind: AccessKind, is_read: bool) {
        let entry = self.thread_state.entry(thread_id).or_default();
        let (stream, pairs, counts) = if is_read {
            (&mut entry.reads, &mut self.pc_pairs_read, &mut self.access_count_read)
        } else {
            (&mut entry.writes, &mut self.pc_pairs_write, &mut self.access_count_write)
        };
        *counts.entry(pc).or_insert(0) += 1;

        if let Some(&(last_pc, last_value)) = stream.get(&addr) {
            if last_value == value {
                *pairs
                    .entry(pc)
                    .or_default()
                    .entry(last_pc)
                    .or_default()
                    .entry((value, access_kind))
                    .or_insert(0) += 1;
            }
        }
        stream.insert(addr, (pc, value));
    }

    fn clear_thread(&mut self, thread_id: ThreadId) {
        self.thread_state.remove(&thread_id);
    }
}

#[derive(Debug, Clone)]
struct TemporalRow {
    from_func: Option<u32>,
    from_pc: u64,
    to_func: Option<u32>,
    to_pc: u64,
    value: String,
    data_type: &'static str,
    vec_size: u32,
    unit_size: u32,
    red_count: u64,
    local_rate: f64,
    norm_rate: f64,
}

fn func_str(f: Option<u32>) -> String {
    f.map(|v| v.to_string()).unwrap_or_else(|| "-1".to_string())
}

impl TemporalRow {
    fn write_csv_row(&self, out: &mut impl Write) -> IoResult<()> {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{}",
            func_str(self.from_func),
            self.from_pc,
            func_str(self.to_func),
            self.to_pc,
            self.value,
            self.data_type,
            self.vec_size,
            self.unit_size,
            self.red_count,
            self.local_rate,
            self.norm_rate
        )
    }
}

/// Per-trace reduction: rank `to_pc`s by total `red_count`, retain the top
/// `pc_views_limit`; for each, rank incoming `(value, source)` pairs by
/// count and retain the top `mem_views_limit`.
fn reduce(
    cubins: &CubinTable,
    kernel: &KernelOp,
    pairs: &PcPairHistogram,
    access_count: &HashMap<u64, u64>,
    pc_views_limit: usize,
    mem_views_limit: usize,
) -> Vec<TemporalRow> {
    let total: u64 = access_count.values().sum();
    let cubin = cubins.get(kernel.cubin_id);
    let module = cubin.as_ref().and_then(|c| c.module(kernel.mod_id));

    let mut pc_red: Vec<(u64, u64)> = pairs
        .iter()
        .map(|(&to_pc, incoming)| {
            let red: u64 = incoming.values().flat_map(|m| m.values()).sum();
            (to_pc, red)
        })
        .collect();
    pc_red.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    pc_red.truncate(pc_views_limit);

    let mut rows = Vec::new();
    for (to_pc, red_count) in pc_red {
        let incoming = &pairs[&to_pc];
        let mut flat: Vec<(u64, (u64, AccessKind), u64)> = incoming
            .iter()
            .flat_map(|(&from_pc, m)| m.iter().map(move |(&(value, ak), &count)| (from_pc, (value, ak), count)))
            .collect();
        flat.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        flat.truncate(mem_views_limit);

        let to_resolved = module.and_then(|m| m.symbols.transform_pc(to_pc));
        let local_access = *access_count.get(&to_pc).unwrap_or(&1).max(&1);

        for (from_pc, (value, ak), count) in flat {
            let from_resolved = module.and_then(|m| m.symbols.transform_pc(from_pc));
            rows.push(TemporalRow {
                from_func: from_resolved.map(|(f, _)| f),
                from_pc: from_resolved.map(|(_, off)| off).unwrap_or(from_pc),
                to_func: to_resolved.map(|(f, _)| f),
                to_pc: to_resolved.map(|(_, off)| off).unwrap_or(to_pc),
                value: ak.value_to_string(value, false),
                data_type: match ak.data_type {
                    crate::binary::DataType::Unknown => "UNKNOWN",
                    crate::binary::DataType::Int => "INT",
                    crate::binary::DataType::Float => "FLOAT",
                },
                vec_size: ak.vec_size,
                unit_size: ak.unit_size,
                red_count: count,
                local_rate: count as f64 / local_access as f64,
                norm_rate: if total == 0 { 0.0 } else { count as f64 / total as f64 },
            });
        }
    }
    rows
}

/// Temporal redundancy.
pub struct TemporalRedundancyAnalyzer {
    cubins: Arc<CubinTable>,
    pc_views_limit: usize,
    mem_views_limit: usize,
    traces: KernelTraceTable<Mutex<TemporalTraceInner>>,
    read_rows: Mutex<HashMap<u32, Vec<TemporalRow>>>,
    write_rows: Mutex<HashMap<u32, Vec<TemporalRow>>>,
}

impl TemporalRedundancyAnalyzer {
    pub fn new(cubins: Arc<CubinTable>, pc_views_limit: usize, mem_views_limit: usize) -> Self {
        Self {
            cubins,
            pc_views_limit,
            mem_views_limit,
            traces: KernelTraceTable::new(),
            read_rows: Mutex::new(HashMap::new()),
            write_rows: Mutex::new(HashMap::new()),
        }
    }
}

impl Analyzer for TemporalRedundancyAnalyzer {
    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::TemporalRedundancy
    }

    fn analysis_begin(&self, cpu_thread: u32, kernel_id: u64, kernel: &KernelOp) {
        self.traces
            .get_or_create(cpu_thread, kernel_id, || Mutex::new(TemporalTraceInner::new(kernel.clone())));
    }

    fn analysis_end(&self, _cpu_thread: u32, _kernel_id: u64) {}

    fn block_enter(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}

    fn block_exit(&self, cpu_thread: u32, kernel_id: u64, thread: ThreadId) {
        if let Some(trace) = self.traces.get(cpu_thread, kernel_id) {
            trace.lock().unwrap().clear_thread(thread);
        }
    }

    fn unit_access(&self, cpu_thread: u32, kernel_id: u64, access: &UnitAccess) {
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        trace.lock().unwrap().record_access(
            access.thread_id,
            access.unit_addr,
            access.pc,
            access.value,
            access.access_kind,
            access.is_read,
        );
    }

    fn flush_thread(&self, cpu_thread: u32, kernel_id: u64) {
        let Some(trace) = self.traces.remove(cpu_thread, kernel_id) else {
            return;
        };
        let inner = trace.lock().unwrap();
        let read_rows = reduce(
            &self.cubins,
            &inner.kernel,
            &inner.pc_pairs_read,
            &inner.access_count_read,
            self.pc_views_limit,
            self.mem_views_limit,
        );
        let write_rows = reduce(
            &self.cubins,
            &inner.kernel,
            &inner.pc_pairs_write,
            &inner.access_count_write,
            self.pc_views_limit,
            self.mem_views_limit,
        );
        self.read_rows.lock().unwrap().entry(cpu_thread).or_default().extend(read_rows);
        self.write_rows.lock().unwrap().entry(cpu_thread).or_default().extend(write_rows);
    }

    fn flush(&self, output_dir: &Path) -> Result<()> {
        write_rows_per_thread(output_dir, "temporal_read", &self.read_rows)?;
        write_rows_per_thread(output_dir, "temporal_write", &self.write_rows)?;
        Ok(())
    }
}

fn write_rows_per_thread(output_dir: &Path, prefix: &str, rows: &Mutex<HashMap<u32, Vec<TemporalRow>>>) -> Result<()> {
    let guard = rows.lock().unwrap();
    for (cpu_thread, rows) in guard.iter() {
        let path = output_dir.join(format!("{prefix}_t{cpu_thread}.csv"));
        if let Err(e) = write_csv(&path, rows) {
            warn!("failed to flush {}: {e}", path.display());
        }
    }
    Ok(())
}

fn write_csv(path: &Path, rows: &[TemporalRow]) -> IoResult<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "from_func,from_pc,to_func,to_pc,value,data_type,vec_size,unit_size,red_count,local_rate,norm_rate"
    )?;
    for row in rows {
        row.write_csv_row(&mut out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::DataType;
    use crate::memory::{Memory, MemoryRange};

    fn kernel() -> KernelOp {
        KernelOp {
            cpu_thread: 0,
            stream_id: 0,
            cubin_id: 1,
            mod_id: 0,
            func_index: 0,
            func_addr: 0,
        }
    }

    fn access(thread: ThreadId, pc: u64, addr: u64, value: u64, is_read: bool) -> UnitAccess {
        UnitAccess {
            kernel_id: 1,
            thread_id: thread,
            access_kind: AccessKind::new(DataType::Int, 32, 32),
            memory: Arc::new(Memory::new(1, 1, MemoryRange::new(0, 1000))),
            pc,
            value,
            is_read,
            unit_addr: addr,
            index: 0,
        }
    }

    /// S3: two same-block writes of the same value from different pcs
    /// increment the pc-pair histogram exactly once.
    #[test]
    fn scenario_s3_temporal_redundancy_within_block() {
        let analyzer = TemporalRedundancyAnalyzer::new(Arc::new(CubinTable::new()), 10, 10);
        let thread = ThreadId::new((0, 0, 0), (0, 0, 0));
        analyzer.analysis_begin(0, 1, &kernel());
        analyzer.block_enter(0, 1, thread);
        analyzer.unit_access(0, 1, &access(thread, 0xA, 0x1000, 7, false));
        analyzer.unit_access(0, 1, &access(thread, 0xB, 0x1000, 7, false));

        let trace = analyzer.traces.get(0, 1).unwrap();
        let count = trace.lock().unwrap().pc_pairs_write[&0xB][&0xA]
            .iter()
            .map(|(_, &c)| c)
            .sum::<u64>();
        assert_eq!(count, 1);
    }

    #[test]
    fn block_exit_prevents_cross_block_false_positives() {
        let analyzer = TemporalRedundancyAnalyzer::new(Arc::new(CubinTable::new()), 10, 10);
        let thread = ThreadId::new((0, 0, 0), (0, 0, 0));
        analyzer.analysis_begin(0, 1, &kernel());
        analyzer.unit_access(0, 1, &access(thread, 0xA, 0x1000, 7, false));
        analyzer.block_exit(0, 1, thread);
        analyzer.block_enter(0, 1, thread);
        analyzer.unit_access(0, 1, &access(thread, 0xB, 0x1000, 7, false));

        let trace = analyzer.traces.get(0, 1).unwrap();
        let inner = trace.lock().unwrap();
        let count: u64 = inner
            .pc_pairs_write
            .get(&0xB)
            .map(|m| m.values().flat_map(|v| v.values()).sum())
            .unwrap_or(0);
        assert_eq!(count, 0);
    }

    #[test]
    fn flush_thread_removes_the_trace() {
        let analyzer = TemporalRedundancyAnalyzer::new(Arc::new(CubinTable::new()), 10, 10);
        analyzer.analysis_begin(0, 1, &kernel());
        analyzer.flush_thread(0, 1);
        assert!(analyzer.traces.get(0, 1).is_none());
    }
}
