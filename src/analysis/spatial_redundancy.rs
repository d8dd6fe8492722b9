//! Spatial redundancy analyzer, grounded on
//! `original_source/src/analysis/spatial_redundancy.cpp`.
//!
//! Models "all lanes write the same value": the redundancy at a pc is the
//! dominant repeated value's count, not the total access count.

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

// (op_id, access_kind) -> pc -> value -> count
type SpatialHistogram = HashMap<(u64, AccessKind), HashMap<u64, HashMap<u64, u64>>>;

#[derive(Debug)]
struct SpatialTraceInner {
    kernel: KernelOp,
    spatial_write: SpatialHistogram,
    spatial_read: SpatialHistogram,
    access_count_write: HashMap<u64, u64>,
    access_count_read: HashMap<u64, u64>,
}

impl SpatialTraceInner {
    fn new(kernel: KernelOp) -> Self {
        Self {
            kernel,
            spatial_write: HashMap::new(),
            spatial_read: HashMap::new(),
            access_count_write: HashMap::new(),
            access_count_read: HashMap::new(),
        }
    }

    fn record(&mut self, op_id: u64, access_kind: AccessKind, pc: u64, value: u64, is_read: bool) {
        let (hist, counts) = if is_read {
            (&mut self.spatial_read, &mut self.access_count_read)
        } else {
            (&mut self.spatial_write, &mut self.access_count_write)
        };
        *counts.entry(pc).or_insert(0) += 1;
        *hist.entry((op_id, access_kind)).or_default().entry(pc).or_default().entry(value).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone)]
struct SpatialRow {
    func: Option<u32>,
    pc: u64,
    op_id: u64,
    value: String,
    data_type: &'static str,
    vec_size: u32,
    unit_size: u32,
    red_count: u64,
    local_rate: f64,
}

impl SpatialRow {
    fn write_csv_row(&self, out: &mut impl Write) -> IoResult<()> {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{}",
            self.func.map(|f| f.to_string()).unwrap_or_else(|| "-1".to_string()),
            self.pc,
            self.op_id,
            self.value,
            self.data_type,
            self.vec_size,
            self.unit_size,
            self.red_count,
            self.local_rate
        )
    }
}

/// Reduces one direction's histogram: for each
/// `(op_id, access_kind)` and pc, take the dominant value's count; rank
/// pcs by that dominant count and retain the top `pc_views_limit`, then
/// retain the top `mem_views_limit` values at each retained pc.
fn reduce(
    cubins: &CubinTable,
    kernel: &KernelOp,
    hist: &SpatialHistogram,
    access_count: &HashMap<u64, u64>,
    pc_views_limit: usize,
    mem_views_limit: usize,
) -> (Vec<SpatialRow>, u64) {
    let cubin = cubins.get(kernel.cubin_id);
    let module = cubin.as_ref().and_then(|c| c.module(kernel.mod_id));

    let mut kernel_spatial_count = 0u64;
    let mut rows = Vec::new();

    for (&(op_id, access_kind), by_pc) in hist {
        let mut pc_dominant: Vec<(u64, u64)> = by_pc
            .iter()
            .map(|(&pc, values)| (pc, values.values().copied().max().unwrap_or(0)))
            .collect();
        for &(_, max_count) in &pc_dominant {
            kernel_spatial_count += max_count;
        }
        pc_dominant.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pc_dominant.truncate(pc_views_limit);

        for (pc, _) in pc_dominant {
            let values = &by_pc[&pc];
            let mut ranked: Vec<(u64, u64)> = values.iter().map(|(&v, &c)| (v, c)).collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            ranked.truncate(mem_views_limit);

            let resolved = module.and_then(|m| m.symbols.transform_pc(pc));
            let local_access = *access_count.get(&pc).unwrap_or(&1).max(&1);
            for (value, count) in ranked {
                rows.push(SpatialRow {
                    func: resolved.map(|(f, _)| f),
                    pc: resolved.map(|(_, off)| off).unwrap_or(pc),
                    op_id,
                    value: access_kind.value_to_string(value, false),
                    data_type: match access_kind.data_type {
                        crate::binary::DataType::Unknown => "UNKNOWN",
                        crate::binary::DataType::Int => "INT",
                        crate::binary::DataType::Float => "FLOAT",
                    },
                    vec_size: access_kind.vec_size,
                    unit_size: access_kind.unit_size,
                    red_count: count,
                    local_rate: count as f64 / local_access as f64,
                });
            }
        }
    }
    (rows, kernel_spatial_count)
}

/// Spatial redundancy.
pub struct SpatialRedundancyAnalyzer {
    cubins: Arc<CubinTable>,
    pc_views_limit: usize,
    mem_views_limit: usize,
    traces: KernelTraceTable<Mutex<SpatialTraceInner>>,
    read_rows: Mutex<HashMap<u32, Vec<SpatialRow>>>,
    write_rows: Mutex<HashMap<u32, Vec<SpatialRow>>>,
}

impl SpatialRedundancyAnalyzer {
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

impl Analyzer for SpatialRedundancyAnalyzer {
    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::SpatialRedundancy
    }

    fn analysis_begin(&self, cpu_thread: u32, kernel_id: u64, kernel: &KernelOp) {
        self.traces
            .get_or_create(cpu_thread, kernel_id, || Mutex::new(SpatialTraceInner::new(kernel.clone())));
    }

    fn analysis_end(&self, _cpu_thread: u32, _kernel_id: u64) {}
    fn block_enter(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}
    fn block_exit(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}

    fn unit_access(&self, cpu_thread: u32, kernel_id: u64, access: &UnitAccess) {
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        trace
            .lock()
            .unwrap()
            .record(access.memory.op_id, access.access_kind, access.pc, access.value, access.is_read);
    }

    fn flush_thread(&self, cpu_thread: u32, kernel_id: u64) {
        let Some(trace) = self.traces.remove(cpu_thread, kernel_id) else {
            return;
        };
        let inner = trace.lock().unwrap();
        let (read_rows, _) = reduce(
            &self.cubins,
            &inner.kernel,
            &inner.spatial_read,
            &inner.access_count_read,
            self.pc_views_limit,
            self.mem_views_limit,
        );
        let (write_rows, _) = reduce(
            &self.cubins,
            &inner.kernel,
            &inner.spatial_write,
            &inner.access_count_write,
            self.pc_views_limit,
            self.mem_views_limit,
        );
        self.read_rows.lock().unwrap().entry(cpu_thread).or_default().extend(read_rows);
        self.write_rows.lock().unwrap().entry(cpu_thread).or_default().extend(write_rows);
    }

    fn flush(&self, output_dir: &Path) -> Result<()> {
        write_rows_per_thread(output_dir, "spatial_read", &self.read_rows)?;
        write_rows_per_thread(output_dir, "spatial_write", &self.write_rows)?;
        Ok(())
    }
}

fn write_rows_per_thread(output_dir: &Path, prefix: &str, rows: &Mutex<HashMap<u32, Vec<SpatialRow>>>) -> Result<()> {
    let guard = rows.lock().unwrap();
    for (cpu_thread, rows) in guard.iter() {
        let path = output_dir.join(format!("{prefix}_t{cpu_thread}.csv"));
        if let Err(e) = write_csv(&path, rows) {
            warn!("failed to flush {}: {e}", path.display());
        }
    }
    Ok(())
}

fn write_csv(path: &Path, rows: &[SpatialRow]) -> IoResult<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "func,pc,op_id,value,data_type,vec_size,unit_size,red_count,local_rate")?;
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

    fn access(pc: u64, value: u64) -> UnitAccess {
        UnitAccess {
            kernel_id: 1,
            thread_id: ThreadId::new((0, 0, 0), (0, 0, 0)),
            access_kind: AccessKind::new(DataType::Float, 32, 32),
            memory: Arc::new(Memory::new(7, 7, MemoryRange::new(0, 1000))),
            pc,
            value,
            is_read: false,
            unit_addr: 0x1000,
            index: 0,
        }
    }

    /// S2: 32 lanes write the same float value at one pc; dominant count is
    /// 32 and local_rate is 1.0.
    #[test]
    fn scenario_s2_single_value_spatial_redundancy() {
        let analyzer = SpatialRedundancyAnalyzer::new(Arc::new(CubinTable::new()), 10, 10);
        analyzer.analysis_begin(0, 1, &kernel());
        for _ in 0..32 {
            analyzer.unit_access(0, 1, &access(0xC0, 0x3F80_0000));
        }
        analyzer.flush_thread(0, 1);

        let rows = analyzer.write_rows.lock().unwrap();
        let row = &rows[&0][0];
        assert_eq!(row.red_count, 32);
        assert_eq!(row.local_rate, 1.0);
    }

    #[test]
    fn flush_thread_removes_the_trace() {
        let analyzer = SpatialRedundancyAnalyzer::new(Arc::new(CubinTable::new()), 10, 10);
        analyzer.analysis_begin(0, 1, &kernel());
        analyzer.flush_thread(0, 1);
        assert!(analyzer.traces.get(0, 1).is_none());
    }
}
