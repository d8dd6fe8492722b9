//! Value-pattern analyzer, grounded on
//! `original_source/src/analysis/value_pattern.cpp`.
//!
//! Classifies each (object, access_kind) array into a set of named value
//! patterns from its accumulated value distribution.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::binary::{AccessKind, DataType};
use crate::config::{AnalysisType, Config};
use crate::error::Result;
use crate::operation::KernelOp;
use crate::types::ThreadId;

use super::{Analyzer, KernelTraceTable, UnitAccess};

const TOP_VALUES: usize = 10;
const DENSE_UNIQUE_OFFSET_RATIO: f64 = 0.5;
const DENSE_DISTINCT_VALUE_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pattern {
    TypeOveruse,
    InappropriateFloat,
    SingleValue,
    RedundantZeros,
    DenseValue,
    NoPattern,
}

impl Pattern {
    fn name(self) -> &'static str {
        match self {
            Pattern::TypeOveruse => "TYPE_OVERUSE",
            Pattern::InappropriateFloat => "INAPPROPRIATE_FLOAT",
            Pattern::SingleValue => "SINGLE_VALUE",
            Pattern::RedundantZeros => "REDUNDANT_ZEROS",
            Pattern::DenseValue => "DENSE_VALUE",
            Pattern::NoPattern => "NO_PATTERN",
        }
    }
}

// offset -> value -> count
type OffsetMap = HashMap<u64, HashMap<u64, u64>>;

#[derive(Debug, Default)]
struct ArrayDist {
    element_count: u64,
    offsets: OffsetMap,
}

#[derive(Debug, Default)]
struct ValuePatternTraceInner {
    // (op_id, access_kind) -> dist
    value_dist: HashMap<(u64, AccessKind), ArrayDist>,
}

impl ValuePatternTraceInner {
    fn record(&mut self, op_id: u64, element_count: u64, access_kind: AccessKind, offset: u64, value: u64) {
        let dist = self.value_dist.entry((op_id, access_kind)).or_default();
        dist.element_count = dist.element_count.max(element_count);
        *dist.offsets.entry(offset).or_default().entry(value).or_insert(0) += 1;
    }
}

/// Leading-zero bits counted from `width - 1` down, reproducing
/// `get_redundant_zeros_bits`'s bit walk").
fn redundant_leading_zero_bits(value: u64, width: u32) -> u32 {
    if width == 0 {
        return 0;
    }
    let flag = 1u64 << (width - 1);
    let mut shifted = value << 1;
    let mut i: i64 = width as i64 - 1;
    while i >= 0 {
        if shifted & flag != 0 {
            break;
        }
        shifted <<= 1;
        i -= 1;
    }
    (width as i64 - 1 - i).max(0) as u32
}

/// Smallest `{8,16,32,64}` unit size `<=` the current one that fits every
/// value, given the minimum redundant leading-zero-bit count observed
/// across the array.
fn narrow_unit_size(min_redundant_bits: u32, unit_size: u32) -> u32 {
    match unit_size {
        64 => {
            if min_redundant_bits >= 56 {
                8
            } else if min_redundant_bits >= 48 {
                16
            } else if min_redundant_bits >= 32 {
                32
            } else {
                64
            }
        }
        32 => {
            if min_redundant_bits >= 24 {
                8
            } else if min_redundant_bits >= 16 {
                16
            } else {
                32
            }
        }
        16 => {
            if min_redundant_bits >= 8 {
                8
            } else {
                16
            }
        }
        other => other,
    }
}

fn float_has_no_decimal(raw: u64, unit_size: u32, eps_f32: f64, eps_f64: f64) -> bool {
    if unit_size >= 64 {
        let v = f64::from_bits(raw);
        (v - v.trunc()).abs() <= eps_f64
    } else {
        let v = f32::from_bits(raw as u32);
        (v - v.trunc()).abs() <= eps_f32 as f32
    }
}

fn is_numerically_zero(raw: u64, access_kind: &AccessKind) -> bool {
    match access_kind.data_type {
        DataType::Float => {
            if access_kind.unit_size >= 64 {
                f64::from_bits(raw).abs() < 1e-14
            } else {
                f32::from_bits(raw as u32).abs() < 1e-6
            }
        }
        _ => raw == 0,
    }
}

#[derive(Debug, Clone)]
struct Classification {
    patterns: Vec<Pattern>,
    narrow_size: Option<u32>,
    top_values: Vec<(u64, u64)>,
}

/// Classifies one (object, access_kind) array.
fn classify(dist: &ArrayDist, access_kind: AccessKind, eps_f32: f64, eps_f64: f64) -> Classification {
    let mut global_counts: HashMap<u64, u64> = HashMap::new();
    let mut singleton_offsets = 0u64;
    let mut min_redundant_bits = access_kind.unit_size;
    let mut inappropriate_float = access_kind.data_type == DataType::Float;

    for values in dist.offsets.values() {
        if values.len() == 1 {
            singleton_offsets += 1;
        }
        for (&value, &count) in values {
            *global_counts.entry(value).or_insert(0) += count;
            match access_kind.data_type {
                DataType::Int => {
                    min_redundant_bits = min_redundant_bits.min(redundant_leading_zero_bits(value, access_kind.unit_size));
                }
                DataType::Float => {
                    if inappropriate_float && !float_has_no_decimal(value, access_kind.unit_size, eps_f32, eps_f64) {
                        inappropriate_float = false;
                    }
                }
                DataType::Unknown => {}
            }
        }
    }

    let touched_offsets = dist.offsets.len() as u64;
    let distinct_values = global_counts.len() as u64;

    let narrow_size = if access_kind.data_type == DataType::Int {
        Some(narrow_unit_size(min_redundant_bits, access_kind.unit_size))
    } else {
        None
    };

    let mut patterns = Vec::new();
    if let Some(narrow) = narrow_size {
        if narrow < access_kind.unit_size {
            patterns.push(Pattern::TypeOveruse);
        }
    }
    if access_kind.data_type == DataType::Float && inappropriate_float && !dist.offsets.is_empty() {
        patterns.push(Pattern::InappropriateFloat);
    }

    let fully_covered = dist.element_count > 0 && touched_offsets >= dist.element_count;
    let single_value = distinct_values == 1 && fully_covered;
    if single_value {
        patterns.push(Pattern::SingleValue);
        let (&only_value, _) = global_counts.iter().next().unwrap();
        if is_numerically_zero(only_value, &access_kind) {
            patterns.push(Pattern::RedundantZeros);
        }
    } else if dist.element_count > 0
        && singleton_offsets as f64 >= DENSE_UNIQUE_OFFSET_RATIO * dist.element_count as f64
        && (distinct_values as f64) <= DENSE_DISTINCT_VALUE_RATIO * dist.element_count as f64
    {
        patterns.push(Pattern::DenseValue);
    }
    if patterns.is_empty() {
        patterns.push(Pattern::NoPattern);
    }

    let mut top_values: Vec<(u64, u64)> = global_counts.into_iter().collect();
    top_values.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top_values.truncate(TOP_VALUES);

    Classification {
        patterns,
        narrow_size,
        top_values,
    }
}

/// Requantizes float values at `(f32_precision, f64_precision)` and
/// re-classifies.
fn classify_approximate(
    dist: &ArrayDist,
    access_kind: AccessKind,
    f32_precision: u32,
    f64_precision: u32,
    eps_f32: f64,
    eps_f64: f64,
) -> Option<Classification> {
    if access_kind.data_type != DataType::Float {
        return None;
    }
    let mut approx = ArrayDist {
        element_count: dist.element_count,
        offsets: HashMap::new(),
    };
    for (&offset, values) in &dist.offsets {
        let entry = approx.offsets.entry(offset).or_default();
        for (&value, &count) in values {
            let quantized = access_kind.value_to_basic_type(value, f32_precision, f64_precision);
            *entry.entry(quantized).or_insert(0) += count;
        }
    }
    Some(classify(&approx, access_kind, eps_f32, eps_f64))
}

#[derive(Debug)]
struct VpRow {
    op_id: u64,
    access_kind: AccessKind,
    patterns: Vec<Pattern>,
    narrow_size: Option<u32>,
    top_values: Vec<(u64, u64)>,
    approximate: Option<(Vec<Pattern>, Vec<(u64, u64)>)>,
}

impl VpRow {
    fn write_csv_row(&self, out: &mut impl Write) -> IoResult<()> {
        let pattern_list = self.patterns.iter().map(|p| p.name()).collect::<Vec<_>>().join(";");
        let top = self
            .top_values
            .iter()
            .map(|(v, c)| format!("{}:{c}", self.access_kind.value_to_string(*v, false)))
            .collect::<Vec<_>>()
            .join(";");
        write!(
            out,
            "{},{},{},{},{}",
            self.op_id,
            self.access_kind,
            pattern_list,
            self.narrow_size.map(|n| n.to_string()).unwrap_or_default(),
            top
        )?;
        if let Some((approx_patterns, approx_top)) = &self.approximate {
            let approx_list = approx_patterns.iter().map(|p| p.name()).collect::<Vec<_>>().join(";");
            let approx_top_str = approx_top
                .iter()
                .map(|(v, c)| format!("{}:{c}", self.access_kind.value_to_string(*v, false)))
                .collect::<Vec<_>>()
                .join(";");
            write!(out, ",approximate:{approx_list},{approx_top_str}")?;
        }
        writeln!(out)
    }
}

/// Value-pattern classification.
pub struct ValuePatternAnalyzer {
    config: Arc<Config>,
    traces: KernelTraceTable<Mutex<ValuePatternTraceInner>>,
    rows: Mutex<HashMap<u32, Vec<VpRow>>>,
}

impl ValuePatternAnalyzer {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            traces: KernelTraceTable::new(),
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl Analyzer for ValuePatternAnalyzer {
    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::ValuePattern
    }

    fn analysis_begin(&self, cpu_thread: u32, kernel_id: u64, _kernel: &KernelOp) {
        self.traces
            .get_or_create(cpu_thread, kernel_id, || Mutex::new(ValuePatternTraceInner::default()));
    }

    fn analysis_end(&self, _cpu_thread: u32, _kernel_id: u64) {}
    fn block_enter(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}
    fn block_exit(&self, _cpu_thread: u32, _kernel_id: u64, _thread: ThreadId) {}

    fn unit_access(&self, cpu_thread: u32, kernel_id: u64, access: &UnitAccess) {
        let Some(trace) = self.traces.get(cpu_thread, kernel_id) else {
            return;
        };
        let unit_bytes = (access.access_kind.unit_size / 8).max(1) as u64;
        let offset = access.unit_addr.saturating_sub(access.memory.range.start) / unit_bytes;
        let element_count = access.memory.len() / unit_bytes;
        trace
            .lock()
            .unwrap()
            .record(access.memory.op_id, element_count, access.access_kind, offset, access.value);
    }

    fn flush_thread(&self, cpu_thread: u32, kernel_id: u64) {
        let Some(trace) = self.traces.remove(cpu_thread, kernel_id) else {
            return;
        };
        let inner = trace.lock().unwrap();
        let eps_f32 = self.config.float_decimal_eps_f32;
        let eps_f64 = self.config.float_decimal_eps_f64;
        let f32_precision = self.config.approximate_precision.f32_precision();
        let f64_precision = self.config.approximate_precision.f64_precision();

        let mut rows = Vec::new();
        for (&(op_id, access_kind), dist) in inner.value_dist.iter() {
            let exact = classify(dist, access_kind, eps_f32, eps_f64);
            let approx = classify_approximate(dist, access_kind, f32_precision, f64_precision, eps_f32, eps_f64);

            let approximate = approx.and_then(|a| {
                let exact_set: HashSet<Pattern> = exact.patterns.iter().copied().collect();
                let approx_set: HashSet<Pattern> = a.patterns.iter().copied().collect();
                if approx_set.difference(&exact_set).next().is_some() {
                    Some((a.patterns, a.top_values))
                } else {
                    None
                }
            });

            rows.push(VpRow {
                op_id,
                access_kind,
                patterns: exact.patterns,
                narrow_size: exact.narrow_size,
                top_values: exact.top_values,
                approximate,
            });
        }
        self.rows.lock().unwrap().entry(cpu_thread).or_default().extend(rows);
    }

    fn flush(&self, output_dir: &Path) -> Result<()> {
        let guard = self.rows.lock().unwrap();
        for (cpu_thread, rows) in guard.iter() {
            let path = output_dir.join(format!("value_pattern_t{cpu_thread}.csv"));
            if let Err(e) = write_csv(&path, rows) {
                warn!("failed to flush {}: {e}", path.display());
            }
        }
        Ok(())
    }
}

fn write_csv(path: &Path, rows: &[VpRow]) -> IoResult<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "op_id,access_kind,patterns,narrow_size,top_values")?;
    for row in rows {
        row.write_csv_row(&mut out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Memory, MemoryRange};

    fn int_access(addr: u64, value: u64, unit_size: u32) -> UnitAccess {
        UnitAccess {
            kernel_id: 1,
            thread_id: ThreadId::new((0, 0, 0), (0, 0, 0)),
            access_kind: AccessKind::new(DataType::Int, unit_size, unit_size),
            memory: Arc::new(Memory::new(1, 1, MemoryRange::new(0, 400))),
            pc: 0,
            value,
            is_read: false,
            unit_addr: addr,
            index: 0,
        }
    }

    #[test]
    fn all_zero_array_is_single_value_and_redundant_zeros() {
        let analyzer = ValuePatternAnalyzer::new(Arc::new(Config::default()));
        analyzer.analysis_begin(0, 1, &KernelOp {
            cpu_thread: 0,
            stream_id: 0,
            cubin_id: 0,
            mod_id: 0,
            func_index: 0,
            func_addr: 0,
        });
        for i in 0..100u64 {
            analyzer.unit_access(0, 1, &int_access(i * 4, 0, 32));
        }
        analyzer.flush_thread(0, 1);
        let rows = analyzer.rows.lock().unwrap();
        let row = &rows[&0][0];
        assert!(row.patterns.contains(&Pattern::SingleValue));
        assert!(row.patterns.contains(&Pattern::RedundantZeros));
    }

    #[test]
    fn leading_zero_of_zero_gives_smallest_narrow_size() {
        // unit_size=32, value 0 -> narrow size should be 8.
        let bits = redundant_leading_zero_bits(0, 32);
        assert_eq!(narrow_unit_size(bits, 32), 8);
    }

    fn float_access(addr: u64, raw: u64) -> UnitAccess {
        UnitAccess {
            kernel_id: 1,
            thread_id: ThreadId::new((0, 0, 0), (0, 0, 0)),
            access_kind: AccessKind::new(DataType::Float, 32, 32),
            memory: Arc::new(Memory::new(1, 1, MemoryRange::new(0, 400))),
            pc: 0,
            value: raw,
            is_read: false,
            unit_addr: addr,
            index: 0,
        }
    }

    #[test]
    fn approximate_pass_collapses_low_mantissa_noise_into_single_value() {
        // 100 elements, 10 distinct raw bit patterns differing only in the
        // lowest 4 mantissa bits of float 1.0 (0x3F800000) -> exact pass
        // sees DENSE_VALUE (distinct <= 10% of array, fully covered); the
        // default Mid precision (f32_precision=15) zeros the low 8 mantissa
        // bits, collapsing every variant back to 0x3F800000 -> approximate
        // pass reports SINGLE_VALUE, which the exact pass did not report.
        let analyzer = ValuePatternAnalyzer::new(Arc::new(Config::default()));
        analyzer.analysis_begin(0, 1, &KernelOp {
            cpu_thread: 0,
            stream_id: 0,
            cubin_id: 0,
            mod_id: 0,
            func_index: 0,
            func_addr: 0,
        });
        for i in 0..100u64 {
            let raw = 0x3F800000u64 | (i % 10);
            analyzer.unit_access(0, 1, &float_access(i * 4, raw));
        }
        analyzer.flush_thread(0, 1);
        let rows = analyzer.rows.lock().unwrap();
        let row = &rows[&0][0];
        assert!(row.patterns.contains(&Pattern::DenseValue));
        assert!(!row.patterns.contains(&Pattern::SingleValue));
        let (approx_patterns, _) = row.approximate.as_ref().expect("approximate pass should fire new patterns");
        assert!(approx_patterns.contains(&Pattern::SingleValue));
    }

    #[test]
    fn dense_value_pattern_fires_for_many_distinct_low_cardinality_values() {
        let analyzer = ValuePatternAnalyzer::new(Arc::new(Config::default()));
        analyzer.analysis_begin(0, 1, &KernelOp {
            cpu_thread: 0,
            stream_id: 0,
            cubin_id: 0,
            mod_id: 0,
            func_index: 0,
            func_addr: 0,
        });
        // 100 elements, only 5 distinct values (5% <= 10%), all touched (100% >= 50%).
        for i in 0..100u64 {
            analyzer.unit_access(0, 1, &int_access(i * 4, i % 5, 32));
        }
        analyzer.flush_thread(0, 1);
        let rows = analyzer.rows.lock().unwrap();
        let row = &rows[&0][0];
        assert!(row.patterns.contains(&Pattern::DenseValue));
    }
}
