//! Public engine facade, the Rust replacement for
//! `original_source/include/redshow.h`'s C global-API surface: an owned
//! `Engine` bundles the registries, the enabled-analyzer set and the
//! ingestion dispatcher, rather than process-global state. Multiple
//! engines may coexist in one process, which is also what makes the
//! per-scenario tests below independent of each other.

use std::path::Path;
use std::sync::Arc;

use log::{error, warn};

use crate::analysis::data_flow::{DataFlowAnalyzer, DtohCallback};
use crate::analysis::heatmap::HeatmapAnalyzer;
use crate::analysis::liveness::LivenessAnalyzer;
use crate::analysis::spatial_redundancy::SpatialRedundancyAnalyzer;
use crate::analysis::temporal_redundancy::TemporalRedundancyAnalyzer;
use crate::analysis::value_pattern::ValuePatternAnalyzer;
use crate::analysis::{Analyzer, Dispatcher, RecordKind};
use crate::binary::{Cubin, DataType};
use crate::config::{AnalysisType, Config, DefaultDataType};
use crate::error::Result;
use crate::memory::{Memory, MemoryRange};
use crate::metrics::Metrics;
use crate::operation::{KernelOp, MemfreeOp, MemoryOp, Operation, OperationKind};
use crate::registry::{CubinTable, MemoryTable};

/// Top-level owned handle bundling every registry, the enabled-analyzer
/// set and the ingestion dispatcher. This is the
/// crate's only public entry point; an embedding runtime drives it through
/// `cubin_register`, `memory_register`/`operation_register`, `analyze`,
/// `kernel_end` and `flush`, mirroring `redshow.h`'s call sequence.
pub struct Engine {
    config: Arc<Config>,
    cubins: Arc<CubinTable>,
    memories: Arc<MemoryTable>,
    metrics: Arc<Metrics>,
    dispatcher: Dispatcher,
    data_flow: Option<Arc<DataFlowAnalyzer>>,
    analyzers: Vec<Arc<dyn Analyzer>>,
}

impl Engine {
    /// Builds an engine with exactly the analyzers named in
    /// `config.enabled_analyses`.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let cubins = Arc::new(CubinTable::new());
        let memories = Arc::new(MemoryTable::new());
        let metrics = Arc::new(Metrics::new());

        let mut analyzers: Vec<Arc<dyn Analyzer>> = Vec::new();
        let mut data_flow = None;

        if config.is_enabled(AnalysisType::TemporalRedundancy) {
            analyzers.push(Arc::new(TemporalRedundancyAnalyzer::new(
                cubins.clone(),
                config.pc_views_limit,
                config.mem_views_limit,
            )));
        }
        if config.is_enabled(AnalysisType::SpatialRedundancy) {
            analyzers.push(Arc::new(SpatialRedundancyAnalyzer::new(
                cubins.clone(),
                config.pc_views_limit,
                config.mem_views_limit,
            )));
        }
        if config.is_enabled(AnalysisType::ValuePattern) {
            analyzers.push(Arc::new(ValuePatternAnalyzer::new(config.clone())));
        }
        if config.is_enabled(AnalysisType::DataFlow) {
            let df = Arc::new(DataFlowAnalyzer::new(config.clone()));
            data_flow = Some(df.clone());
            analyzers.push(df);
        }
        if config.is_enabled(AnalysisType::MemoryLiveness) {
            analyzers.push(Arc::new(LivenessAnalyzer::new()));
        }
        if config.is_enabled(AnalysisType::MemoryHeatmap) {
            analyzers.push(Arc::new(HeatmapAnalyzer::new()));
        }

        let dispatcher = Dispatcher::new(analyzers.clone());

        Self {
            config,
            cubins,
            memories,
            metrics,
            dispatcher,
            data_flow,
            analyzers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn cubins(&self) -> &CubinTable {
        &self.cubins
    }

    pub fn memories(&self) -> &MemoryTable {
        &self.memories
    }

    /// Registers the device-to-host mirror callback the data-flow
    /// analyzer's shadow buffers depend on.
    /// A no-op (with a warning) if data-flow analysis is disabled.
    pub fn set_dtoh_callback(&self, callback: DtohCallback) {
        match &self.data_flow {
            Some(df) => df.set_dtoh_callback(callback),
            None => warn!("set_dtoh_callback called but DataFlow analysis is disabled"),
        }
    }

    /// Parses a cubin's JSON-described instructions and registers them
    /// under `cubin_id`.
    pub fn cubin_register(&self, cubin_id: u32, mod_id: u32, path: &Path) -> Result<()> {
        let default_data_type = match self.config.default_data_type {
            DefaultDataType::Int => DataType::Int,
            DefaultDataType::Float => DataType::Float,
        };
        let cubin = Cubin::parse(cubin_id, mod_id, path, default_data_type)?;
        self.cubins.register(cubin_id, cubin)
    }

    pub fn cubin_unregister(&self, cubin_id: u32) -> Result<()> {
        self.cubins.unregister(cubin_id)
    }

    /// Registers a live memory object, both in the shared `MemoryTable`
    /// (used by the dispatcher to resolve access addresses) and as a
    /// `Memory` lifecycle `Operation` fanned out to every analyzer's
    /// `op_callback`.
    pub fn memory_register(&self, op_id: u64, ctx_id: i32, start: u64, end: u64) -> Result<()> {
        let range = MemoryRange::new(start, end);
        self.operation_register(Operation::new(op_id, ctx_id, OperationKind::Memory(MemoryOp { range })))
    }

    /// Frees a previously registered memory object.
    pub fn memory_unregister(&self, op_id: u64, ctx_id: i32, start: u64, end: u64) -> Result<()> {
        let range = MemoryRange::new(start, end);
        self.operation_register(Operation::new(
            op_id,
            ctx_id,
            OperationKind::Memfree(MemfreeOp { range, len: range.len() }),
        ))
    }

    /// Coarse-grained lifecycle event.
    /// `Memory`/`Memfree` variants also mutate the shared `MemoryTable`;
    /// every variant is fanned out to each enabled analyzer's
    /// `op_callback`. A registry failure (duplicate range, unknown free)
    /// is returned to the caller and no analyzer sees the event — a
    /// duplicate insert is indicative of a runtime bug and must not
    /// silently proceed.
    pub fn operation_register(&self, op: Operation) -> Result<()> {
        match &op.kind {
            OperationKind::Memory(mem_op) => {
                self.memories.register(Memory::new(op.op_id, op.ctx_id, mem_op.range))?;
            }
            OperationKind::Memfree(free) => {
                self.memories.unregister(free.range.start)?;
            }
            OperationKind::Kernel(_) | OperationKind::Memcpy(_) | OperationKind::Memset(_) => {}
        }
        for analyzer in &self.analyzers {
            analyzer.op_callback(&op);
        }
        Ok(())
    }

    /// Ingests one raw trace buffer for a single kernel launch.
    /// Corrupt buffers are rejected and counted
    /// without aborting the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn analyze(
        &self,
        cpu_thread: u32,
        kernel_id: u64,
        kernel: &KernelOp,
        buf: &[u8],
        record_count: u32,
        record_kind: RecordKind,
    ) -> Result<()> {
        let result = self.dispatcher.analyze(
            cpu_thread,
            kernel_id,
            kernel,
            &self.cubins,
            &self.memories,
            &self.config,
            &self.metrics,
            buf,
            record_count,
            record_kind,
        );
        match &result {
            Ok(()) => self.metrics.record_buffer_processed(),
            Err(e) => {
                error!("rejecting corrupt trace buffer: {e}");
                self.metrics.record_buffer_rejected();
            }
        }
        result
    }

    /// Finalizes and retires the per-(cpu_thread, kernel_id) trace on
    /// every enabled analyzer.
    pub fn kernel_end(&self, cpu_thread: u32, kernel_id: u64) {
        for analyzer in &self.analyzers {
            analyzer.flush_thread(cpu_thread, kernel_id);
        }
    }

    /// Dumps every enabled analyzer's aggregated results under
    /// `config.output_dir`. I/O failures are
    /// logged, not propagated; analyzers retain their state so a later
    /// flush may succeed.
    pub fn flush(&self) -> Result<()> {
        if let Err(e) = std::fs::create_dir_all(&self.config.output_dir) {
            warn!("failed to create output directory {}: {e}", self.config.output_dir.display());
            self.metrics.record_flush_failure();
            return Ok(());
        }
        for analyzer in &self.analyzers {
            if let Err(e) = analyzer.flush(&self.config.output_dir) {
                error!("analyzer {:?} flush failed: {e}", analyzer.analysis_type());
                self.metrics.record_flush_failure();
            }
        }
        self.metrics.record_flush_completed();
        log::info!(
            "redshow {} flush complete: {} buffers processed, {} unresolved accesses",
            self.metrics.engine_version(),
            self.metrics.buffers_processed(),
            self.metrics.unresolved_accesses()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisType;
    use std::collections::HashSet;
    use std::io::Write;

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

    fn encode_record(thread: [u32; 6], pc: u64, flags: u32, lanes: &[(u64, u64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for c in thread {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf.extend_from_slice(&pc.to_le_bytes());
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&(lanes.len() as u32).to_le_bytes());
        for (addr, val) in lanes {
            buf.extend_from_slice(&addr.to_le_bytes());
            buf.extend_from_slice(&val.to_le_bytes());
        }
        buf
    }

    #[test]
    fn cubin_register_then_unregister_round_trips() {
        let engine = Engine::new(Config::default());
        let json = r#"[{"index":0,"address":0,"blocks":[{"insts":[
            {"pc": 1, "op": "MEMORY.LOAD.GLOBAL.32", "dsts": [1], "srcs": []}
        ]}]}]"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        engine.cubin_register(1, 0, file.path()).unwrap();
        assert_eq!(engine.cubins().len(), 1);
        engine.cubin_unregister(1).unwrap();
        assert!(engine.cubins().is_empty());
    }

    #[test]
    fn memory_register_then_unregister_round_trips() {
        let engine = Engine::new(Config::default());
        engine.memory_register(1, 1, 0, 100).unwrap();
        assert_eq!(engine.memories().len(), 1);
        engine.memory_unregister(1, 1, 0, 100).unwrap();
        assert!(engine.memories().is_empty());
    }

    #[test]
    fn duplicate_memory_register_is_rejected_without_reaching_analyzers() {
        let engine = Engine::new(Config::default());
        engine.memory_register(1, 1, 0, 100).unwrap();
        let err = engine.memory_register(2, 2, 50, 150).unwrap_err();
        assert!(matches!(err, crate::error::RedshowError::Duplicate(_)));
    }

    /// End-to-end: register a cubin and a memory object, feed one trace
    /// buffer through `analyze`, retire the kernel, and flush — every
    /// configured CSV output should land under the output directory.
    #[test]
    fn end_to_end_analyze_and_flush_writes_csv_outputs() {
        let outdir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output_dir = outdir.path().to_path_buf();
        config.enabled_analyses = HashSet::from([
            AnalysisType::TemporalRedundancy,
            AnalysisType::SpatialRedundancy,
        ]);
        let engine = Engine::new(config);

        let json = r#"[{"index":0,"address":0,"blocks":[{"insts":[
            {"pc": 64, "op": "MEMORY.STORE.GLOBAL.32", "dsts": [], "srcs": [{"id": 10}, {"id": 11}]}
        ]}]}]"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        engine.cubin_register(1, 0, file.path()).unwrap();
        engine.memory_register(5, 5, 0x1000, 0x2000).unwrap();

        let buf = encode_record([0, 0, 0, 0, 0, 0], 64, 1 << 1, &[(0x1000, 7)]);
        engine.analyze(0, 1, &kernel(), &buf, 1, RecordKind::Default).unwrap();
        engine.kernel_end(0, 1);
        engine.flush().unwrap();

        assert!(outdir.path().join("temporal_write_t0.csv").exists());
        assert!(outdir.path().join("spatial_write_t0.csv").exists());
        assert_eq!(engine.metrics().buffers_processed(), 1);
        assert_eq!(engine.metrics().flushes_completed(), 1);
    }

    #[test]
    fn corrupt_buffer_is_rejected_and_counted() {
        let engine = Engine::new(Config::default());
        engine.memory_register(5, 5, 0x1000, 0x2000).unwrap();
        let truncated = vec![0u8; 4];
        let err = engine.analyze(0, 1, &kernel(), &truncated, 1, RecordKind::Default).unwrap_err();
        assert!(matches!(err, crate::error::RedshowError::CorruptBuffer(_)));
        assert_eq!(engine.metrics().buffers_rejected(), 1);
    }
}
