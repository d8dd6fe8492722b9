//! Data-flow graph analyzer, grounded on
//! `original_source/src/analysis/data_flow.cpp`.
//!
//! The graph's nodes are calling contexts (`ctx_id`, widened to `i64` so the
//! reserved pseudo-memory ids share the same index space); edges summarize
//! ORDER (write-after-write), READ (read-from) and SINK (copy to host/UVM)
//! dependencies, each carrying accumulated redundancy/overwrite/count
//! metrics.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::binary::{EdgeEndpoints, Graph};
use crate::config::{AnalysisType, Config};
use crate::error::Result;
use crate::interval::IntervalSet;
use crate::memory::{Memory, MemoryRange, CONSTANT_ID, HOST_ID, LOCAL_ID, PSEUDO_BASE, SHARED_ID, UVM_ID};
use crate::operation::{KernelOp, MemcpyOp, MemfreeOp, MemoryOp, MemsetOp, Operation, OperationKind, OperationType};
use crate::registry::OpNodeTable;
use crate::types::ThreadId;

use super::{Analyzer, KernelTraceTable, UnitAccess};

/// User-registered device-to-host mirror: fills `buf` (sized to the device
/// range's length) with the current device bytes at `device_addr`. Absent
/// registration means shadow buffers stay `None` and redundancy reads as 0.
pub type DtohCallback = Arc<dyn Fn(u64, &mut [u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeKind {
    Order,
    Read,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EdgeKey {
    pub from: i64,
    pub to: i64,
    pub memory_ctx: i64,
    pub kind: EdgeKind,
}

impl EdgeEndpoints<i64> for EdgeKey {
    fn from_node(&self) -> i64 {
        self.from
    }
    fn to_node(&self) -> i64 {
        self.to
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeData {
    pub redundancy: u64,
    pub overwrite: u64,
    pub count: u64,
}

#[derive(Debug)]
struct DataFlowTraceInner {
    kernel: KernelOp,
    read_ranges: HashMap<u64, IntervalSet>,
    write_ranges: HashMap<u64, IntervalSet>,
}

impl DataFlowTraceInner {
    fn new(kernel: KernelOp) -> Self {
        Self {
            kernel,
            read_ranges: HashMap::new(),
            write_ranges: HashMap::new(),
        }
    }
}

fn bytewise_equal(a: &[u8], a_start: u64, b: &[u8], b_start: u64, len: u64) -> u64 {
    let a_start = a_start as usize;
    let b_start = b_start as usize;
    let len = (len as usize)
        .min(a.len().saturating_sub(a_start))
        .min(b.len().saturating_sub(b_start));
    (0..len).filter(|&i| a[a_start + i] == b[b_start + i]).count() as u64
}

/// Maintains the cross-kernel data-flow graph.
pub struct DataFlowAnalyzer {
    config: Arc<Config>,
    op_node: OpNodeTable,
    /// op_id -> this analyzer's own shadow-carrying `Memory` record. Kept
    /// even after free for audit.
    memories: Mutex<HashMap<u64, Arc<Memory>>>,
    graph: Mutex<Graph<i64, OperationType, EdgeKey, EdgeData>>,
    visit_count: Mutex<HashMap<i64, u64>>,
    node_hash: Mutex<HashMap<i64, HashSet<String>>>,
    traces: KernelTraceTable<Mutex<DataFlowTraceInner>>,
    dtoh: Mutex<Option<DtohCallback>>,
}

impl DataFlowAnalyzer {
    pub fn new(config: Arc<Config>) -> Self {
        let analyzer = Self {
            config,
            op_node: OpNodeTable::new(),
            memories: Mutex::new(HashMap::new()),
            graph: Mutex::new(Graph::new()),
            visit_count: Mutex::new(HashMap::new()),
            node_hash: Mutex::new(HashMap::new()),
            traces: KernelTraceTable::new(),
            dtoh: Mutex::new(None),
        };
        for &pseudo in &[SHARED_ID, CONSTANT_ID, UVM_ID, HOST_ID, LOCAL_ID] {
            analyzer.ensure_node(pseudo as i64, OperationType::Memory);
        }
        analyzer
    }

    pub fn set_dtoh_callback(&self, callback: DtohCallback) {
        *self.dtoh.lock().unwrap() = Some(callback);
    }

    fn ensure_node(&self, ctx_id: i64, op_type: OperationType) {
        let mut graph = self.graph.lock().unwrap();
        if !graph.has_node(ctx_id) {
            graph.add_node(ctx_id, op_type);
        } else if let Some(n) = graph.node_mut(ctx_id) {
            *n = op_type;
        }
        drop(graph);
        *self.visit_count.lock().unwrap().entry(ctx_id).or_insert(0) += 1;
    }

    fn link_edge(&self, from: i64, to: i64, memory_ctx: i64, kind: EdgeKind, redundancy: u64, overwrite: u64) {
        let key = EdgeKey { from, to, memory_ctx, kind };
        let mut graph = self.graph.lock().unwrap();
        if !graph.has_edge(key) {
            graph.add_edge(key, EdgeData::default());
        }
        let edge = graph.edge_mut(key).expect("just inserted");
        edge.redundancy += redundancy;
        edge.overwrite += overwrite;
        edge.count += 1;
    }

    fn hash_post_state(&self, ctx_id: i64, memory: &Memory) {
        use sha2::{Digest, Sha256};
        let shadow = memory.shadow.lock().unwrap();
        let Some(bytes) = shadow.as_ref() else {
            return;
        };
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_slice());
        let digest = format!("{:x}", hasher.finalize());
        self.node_hash.lock().unwrap().entry(ctx_id).or_default().insert(digest);
    }

    fn on_memory_alloc(&self, op: &Operation, mem_op: &MemoryOp) {
        self.ensure_node(op.ctx_id as i64, OperationType::Memory);
        self.op_node.set_writer(op.op_id, op.ctx_id);
        let memory = Arc::new(Memory::new(op.op_id, op.ctx_id, mem_op.range));
        if let Some(callback) = self.dtoh.lock().unwrap().clone() {
            let mut buf = vec![0u8; memory.len() as usize];
            callback(mem_op.range.start, &mut buf);
            *memory.shadow.lock().unwrap() = Some(buf);
        }
        self.memories.lock().unwrap().insert(op.op_id, memory);
    }

    fn on_memset(&self, op: &Operation, set: &MemsetOp) {
        self.ensure_node(op.ctx_id as i64, OperationType::Memset);
        let Some(memory) = self.memories.lock().unwrap().get(&set.memory_op_id).cloned() else {
            return;
        };

        let redundancy = {
            let shadow = memory.shadow.lock().unwrap();
            shadow.as_ref().map_or(0, |bytes| {
                let start = set.shadow_start as usize;
                let end = (start + set.len as usize).min(bytes.len());
                bytes
                    .get(start..end)
                    .map_or(0, |slice| slice.iter().filter(|&&b| b == set.value).count() as u64)
            })
        };
        let overwrite = set.len;

        if let Some(prev_ctx) = self.op_node.writer(set.memory_op_id) {
            self.link_edge(prev_ctx as i64, op.ctx_id as i64, memory.ctx_id as i64, EdgeKind::Order, redundancy, overwrite);
        }
        self.op_node.set_writer(set.memory_op_id, op.ctx_id);

        let mut shadow = memory.shadow.lock().unwrap();
        let buf = shadow.get_or_insert_with(|| vec![0u8; memory.len() as usize]);
        let start = (set.shadow_start as usize).min(buf.len());
        let end = (start + set.len as usize).min(buf.len());
        for b in &mut buf[start..end] {
            *b = set.value;
        }
        drop(shadow);

        if self.config.content_hashing {
            self.hash_post_state(op.ctx_id as i64, &memory);
        }
    }

    fn on_memcpy(&self, op: &Operation, cpy: &MemcpyOp) {
        self.ensure_node(op.ctx_id as i64, OperationType::Memcpy);
        let memories = self.memories.lock().unwrap();
        let src = memories.get(&cpy.src_op_id).cloned();
        let dst = memories.get(&cpy.dst_op_id).cloned();
        drop(memories);

        let redundancy = match (&src, &dst) {
            (Some(s), Some(d)) => {
                let s_shadow = s.shadow.lock().unwrap();
                let d_shadow = d.shadow.lock().unwrap();
                match (s_shadow.as_ref(), d_shadow.as_ref()) {
                    (Some(sb), Some(db)) => {
                        bytewise_equal(sb, cpy.src_shadow_start, db, cpy.dst_shadow_start, cpy.len)
                    }
                    _ => 0,
                }
            }
            _ => 0,
        };
        let overwrite = cpy.len;

        if let Some(src_ctx) = self.op_node.writer(cpy.src_op_id) {
            let memory_ctx = src.as_ref().map_or(src_ctx as i64, |m| m.ctx_id as i64);
            self.link_edge(src_ctx as i64, op.ctx_id as i64, memory_ctx, EdgeKind::Read, 0, cpy.len);
        }

        let dst_is_pseudo = cpy.dst_op_id >= PSEUDO_BASE;
        if dst_is_pseudo {
            self.ensure_node(cpy.dst_op_id as i64, OperationType::Memory);
            self.link_edge(op.ctx_id as i64, cpy.dst_op_id as i64, cpy.dst_op_id as i64, EdgeKind::Sink, redundancy, overwrite);
        } else {
            if let Some(prev_ctx) = self.op_node.writer(cpy.dst_op_id) {
                let memory_ctx = dst.as_ref().map_or(prev_ctx as i64, |m| m.ctx_id as i64);
                self.link_edge(prev_ctx as i64, op.ctx_id as i64, memory_ctx, EdgeKind::Order, redundancy, overwrite);
            }
            self.op_node.set_writer(cpy.dst_op_id, op.ctx_id);
        }

        if let (Some(s), Some(d)) = (&src, &dst) {
            let s_shadow = s.shadow.lock().unwrap();
            if let Some(sbuf) = s_shadow.as_ref() {
                let sstart = cpy.src_shadow_start as usize;
                let slen = cpy.len as usize;
                if sstart + slen <= sbuf.len() {
                    let copied = sbuf[sstart..sstart + slen].to_vec();
                    drop(s_shadow);
                    let mut d_shadow = d.shadow.lock().unwrap();
                    let buf = d_shadow.get_or_insert_with(|| vec![0u8; d.len() as usize]);
                    let dstart = (cpy.dst_shadow_start as usize).min(buf.len());
                    let dend = (dstart + copied.len()).min(buf.len());
                    buf[dstart..dend].copy_from_slice(&copied[..dend - dstart]);
                }
            }
        }

        if self.config.content_hashing {
            if let Some(d) = &dst {
                self.hash_post_state(op.ctx_id as i64, d);
            } else if dst_is_pseudo {
                // HOST/UVM sinks have no tracked shadow; nothing to hash.
            }
        }
    }

    fn on_memfree(&self, op: &Operation, _free: &MemfreeOp) {
        self.ensure_node(op.ctx_id as i64, OperationType::Memfree);
        // `memories` is append-only for audit; the freed
        // object's op_id keeps resolving to its last-known shadow state.
    }

    /// Duplicate analysis at flush: hashes
    /// shared across ctx_ids are "total" duplicates iff both sides have
    /// exactly that one hash, else "partial".
    fn analyze_duplicate(&self) -> HashMap<i64, Vec<(i64, bool)>> {
        let node_hash = self.node_hash.lock().unwrap();
        let mut hash_nodes: HashMap<&str, Vec<(i64, bool)>> = HashMap::new();
        for (&ctx, hashes) in node_hash.iter() {
            let total = hashes.len() == 1;
            for hash in hashes {
                hash_nodes.entry(hash.as_str()).or_default().push((ctx, total));
            }
        }
        let mut duplicate: HashMap<i64, Vec<(i64, bool)>> = HashMap::new();
        for nodes in hash_nodes.values() {
            if nodes.len() < 2 {
                continue;
            }
            for &(ctx_a, total_a) in nodes {
                for &(ctx_b, total_b) in nodes {
                    if ctx_a == ctx_b {
                        continue;
                    }
                    duplicate.entry(ctx_a).or_default().push((ctx_b, total_a && total_b));
                }
            }
        }
        duplicate
    }

    fn write_dot(&self, output_dir: &Path) -> IoResult<()> {
        let duplicate = self.analyze_duplicate();
        let graph = self.graph.lock().unwrap();
        let visit_count = self.visit_count.lock().unwrap();

        let path = output_dir.join("data_flow.dot");
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "digraph data_flow {{")?;

        for ctx_id in graph.node_indices() {
            let op_type = graph.node(ctx_id).copied().unwrap_or(OperationType::Memory);
            let dups = duplicate.get(&ctx_id).map(|v| {
                v.iter()
                    .map(|(other, total)| format!("{other}:{}", if *total { "total" } else { "partial" }))
                    .collect::<Vec<_>>()
                    .join(";")
            });
            let visits = visit_count.get(&ctx_id).copied().unwrap_or(0);
            writeln!(
                out,
                "  \"{ctx_id}\" [type=\"{op_type:?}\", duplicate=\"{}\", visits={visits}];",
                dups.unwrap_or_default()
            )?;
        }

        for ctx_id in graph.node_indices() {
            for edge_key in graph.outgoing_nodes(ctx_id) {
                let edge = graph.edge(*edge_key).copied().unwrap_or_default();
                let avg_redundancy = if edge.overwrite > 0 {
                    edge.redundancy as f64 / edge.overwrite as f64
                } else {
                    0.0
                };
                let avg_overwrite = if edge.count > 0 {
                    edge.overwrite as f64 / edge.count as f64
                } else {
                    0.0
                };
                writeln!(
                    out,
                    "  \"{}\" -> \"{}\" [kind=\"{:?}\", memory_node_id=\"{}\", avg_redundancy={avg_redundancy:.4}, avg_overwrite={avg_overwrite:.4}, count={}];",
                    edge_key.from_node(),
                    edge_key.to_node(),
                    edge_key.kind,
                    edge_key.memory_ctx,
                    edge.count
                )?;
            }
        }
        writeln!(out, "}}")
    }
}

impl Analyzer for DataFlowAnalyzer {
    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::DataFlow
    }

    fn op_callback(&self, op: &Operation) {
        match &op.kind {
            OperationKind::Memory(mem_op) => self.on_memory_alloc(op, mem_op),
            OperationKind::Memcpy(cpy) => self.on_memcpy(op, cpy),
            OperationKind::Memset(set) => self.on_memset(op, set),
            OperationKind::Memfree(free) => self.on_memfree(op, free),
            OperationKind::Kernel(_) => {}
        }
    }

    fn analysis_begin(&self, cpu_thread: u32, kernel_id: u64, kernel: &KernelOp) {
        self.ensure_node(kernel_id as i64, OperationType::Kernel);
        self.traces
            .get_or_create(cpu_thread, kernel_id, || Mutex::new(DataFlowTraceInner::new(kernel.clone())));
    }

    fn analysis_end(&self, cpu_thread: u32, kernel_id: u64) {
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        let trace = trace.lock().unwrap();
        let kernel_ctx = kernel_id as i64;

        for (&op_id, ranges) in &trace.read_ranges {
            let Some(writer_ctx) = self.op_node.writer(op_id) else {
                continue;
            };
            let memory_ctx = self
                .memories
                .lock()
                .unwrap()
                .get(&op_id)
                .map_or(writer_ctx as i64, |m| m.ctx_id as i64);
            let len = ranges.total_len();
            self.link_edge(writer_ctx as i64, kernel_ctx, memory_ctx, EdgeKind::Read, 0, len);
        }

        for (&op_id, ranges) in &trace.write_ranges {
            let memories = self.memories.lock().unwrap();
            let Some(memory) = memories.get(&op_id).cloned() else {
                continue;
            };
            drop(memories);

            let overwrite = ranges.total_len();
            let redundancy = {
                let shadow = memory.shadow.lock().unwrap();
                let shadow_cache = memory.shadow_cache.lock().unwrap();
                match (shadow.as_ref(), shadow_cache.as_ref()) {
                    (Some(shadow), Some(cache)) => {
                        let base = memory.range.start;
                        ranges
                            .iter()
                            .map(|r| {
                                let start = r.start - base;
                                bytewise_equal(shadow, start, cache, start, r.len())
                            })
                            .sum()
                    }
                    _ => 0,
                }
            };

            if let Some(prev_ctx) = self.op_node.writer(op_id) {
                self.link_edge(prev_ctx as i64, kernel_ctx, memory.ctx_id as i64, EdgeKind::Order, redundancy, overwrite);
            }
            self.op_node.set_writer(op_id, kernel_id as i32);

            let shadow_snapshot = memory.shadow.lock().unwrap().clone();
            *memory.shadow_cache.lock().unwrap() = shadow_snapshot;

            if self.config.content_hashing {
                self.hash_post_state(kernel_ctx, &memory);
            }
        }
    }

    fn block_enter(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}
    fn block_exit(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}

    fn unit_access(&self, cpu_thread: u32, kernel_id: u64, access: &UnitAccess) {
        if access.memory.op_id >= PSEUDO_BASE {
            return;
        }
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        let mut inner = trace.lock().unwrap();
        let unit_bytes = (access.access_kind.unit_size / 8).max(1) as u64;
        let range = MemoryRange::new(access.unit_addr, access.unit_addr + unit_bytes);

        if access.is_read {
            let entry = inner.read_ranges.entry(access.memory.op_id).or_default();
            if !self.config.read_trace_ignore || entry.is_empty() {
                entry.insert(range);
            }
        } else {
            inner.write_ranges.entry(access.memory.op_id).or_default().insert(range);
        }
    }

    fn flush_thread(&self, cpu_thread: u32, kernel_id: u64) {
        self.traces.remove(cpu_thread, kernel_id);
    }

    fn flush(&self, output_dir: &Path) -> Result<()> {
        if let Err(e) = self.write_dot(output_dir) {
            warn!("failed to flush data_flow.dot: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRange;

    fn op(op_id: u64, ctx_id: i32, kind: OperationKind) -> Operation {
        Operation::new(op_id, ctx_id, kind)
    }

    /// S1: alloc A, kernel K1 writes A, memcpy A -> HOST. The dtoh callback
    /// is never wired, so redundancy stays 0, but the ORDER/SINK edges and
    /// op_node chaining still connect K1 -> the memcpy's ctx.
    #[test]
    fn scenario_s1_kernel_then_dtoh_copy_chain() {
        let analyzer = DataFlowAnalyzer::new(Arc::new(Config::default()));

        analyzer.op_callback(&op(
            1,
            10,
            OperationKind::Memory(MemoryOp { range: MemoryRange::new(0, 64) }),
        ));

        let kernel = KernelOp {
            cpu_thread: 0,
            stream_id: 0,
            cubin_id: 1,
            mod_id: 0,
            func_index: 0,
            func_addr: 0,
        };
        analyzer.analysis_begin(0, 20, &kernel);
        let access = UnitAccess {
            kernel_id: 20,
            thread_id: ThreadId::new((0, 0, 0), (0, 0, 0)),
            access_kind: crate::binary::AccessKind::new(crate::binary::DataType::Int, 32, 32),
            memory: Arc::new(Memory::new(1, 10, MemoryRange::new(0, 64))),
            pc: 0,
            value: 0,
            is_read: false,
            unit_addr: 0,
            index: 0,
        };
        analyzer.unit_access(0, 20, &access);
        analyzer.analysis_end(0, 20);
        analyzer.flush_thread(0, 20);

        analyzer.op_callback(&op(
            2,
            30,
            OperationKind::Memcpy(MemcpyOp {
                src_op_id: 1,
                src_shadow_start: 0,
                dst_op_id: HOST_ID,
                dst_shadow_start: 0,
                len: 64,
            }),
        ));

        let graph = analyzer.graph.lock().unwrap();
        assert!(graph.has_edge(EdgeKey { from: 20, to: 30, memory_ctx: 10, kind: EdgeKind::Order }));
        assert!(graph.has_edge(EdgeKey {
            from: 30,
            to: HOST_ID as i64,
            memory_ctx: HOST_ID as i64,
            kind: EdgeKind::Sink
        }));
    }

    #[test]
    fn memset_redundancy_counts_bytes_already_equal_to_fill() {
        let analyzer = DataFlowAnalyzer::new(Arc::new(Config::default()));
        analyzer.op_callback(&op(
            1,
            10,
            OperationKind::Memory(MemoryOp { range: MemoryRange::new(0, 16) }),
        ));
        {
            let memories = analyzer.memories.lock().unwrap();
            *memories[&1].shadow.lock().unwrap() = Some(vec![0u8; 16]);
        }
        analyzer.op_callback(&op(
            2,
            20,
            OperationKind::Memset(MemsetOp { memory_op_id: 1, shadow_start: 0, value: 0, len: 16 }),
        ));
        let graph = analyzer.graph.lock().unwrap();
        let edge = graph
            .edge(EdgeKey { from: 10, to: 20, memory_ctx: 10, kind: EdgeKind::Order })
            .unwrap();
        assert_eq!(edge.redundancy, 16);
        assert_eq!(edge.overwrite, 16);
    }

    #[test]
    fn reserved_pseudo_nodes_exist_at_construction() {
        let analyzer = DataFlowAnalyzer::new(Arc::new(Config::default()));
        let graph = analyzer.graph.lock().unwrap();
        assert!(graph.has_node(HOST_ID as i64));
        assert!(graph.has_node(SHARED_ID as i64));
    }
}
