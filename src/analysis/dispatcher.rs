//! Ingestion dispatcher: decodes one raw trace buffer and
//! fans records out to every enabled analyzer's `unit_access`, bracketed
//! by `block_enter`/`block_exit` on block-boundary changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Buf;
use log::warn;

use crate::binary::{AccessKind, Cubin};
use crate::config::Config;
use crate::error::{RedshowError, Result};
use crate::memory::{self, Memory, MemoryRange};
use crate::metrics::Metrics;
use crate::operation::KernelOp;
use crate::registry::{CubinTable, MemoryTable};
use crate::types::ThreadId;

use super::{Analyzer, UnitAccess};

pub const FLAG_READ: u32 = 1 << 0;
pub const FLAG_WRITE: u32 = 1 << 1;

/// Whether a trace buffer's records carry value payloads or addresses only (ADDRESS_PATCH/ADDRESS_ANALYSIS,
/// used by analyzers that never inspect value bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Default,
    AddressOnly,
}

#[derive(Debug, Clone)]
struct Lane {
    address: u64,
    value: u64,
}

#[derive(Debug, Clone)]
struct AccessRecord {
    thread_id: ThreadId,
    pc: u64,
    flags: u32,
    lanes: Vec<Lane>,
}

/// Wire layout (one record): ThreadId (6 x u32), pc (u64), flags (u32),
/// lane_count (u32), then `lane_count` lanes of (address: u64[, value: u64
/// for `RecordKind::Default`]).
fn decode_records(buf: &[u8], kind: RecordKind, count: u32) -> Result<Vec<AccessRecord>> {
    let mut cursor = buf;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let record_min = 24 + 8 + 4 + 4;
        if cursor.remaining() < record_min {
            return Err(RedshowError::CorruptBuffer(
                "trace buffer truncated before record header".into(),
            ));
        }
        let mut coords = [0u32; 6];
        for c in coords.iter_mut() {
            *c = cursor.get_u32_le();
        }
        let thread_id = ThreadId {
            block_idx_x: coords[0],
            block_idx_y: coords[1],
            block_idx_z: coords[2],
            thread_idx_x: coords[3],
            thread_idx_y: coords[4],
            thread_idx_z: coords[5],
        };
        let pc = cursor.get_u64_le();
        let flags = cursor.get_u32_le();
        let lane_count = cursor.get_u32_le();

        let lane_width = match kind {
            RecordKind::Default => 16,
            RecordKind::AddressOnly => 8,
        };
        let needed = lane_count as usize * lane_width;
        if cursor.remaining() < needed {
            return Err(RedshowError::CorruptBuffer(format!(
                "trace buffer truncated: need {needed} bytes for {lane_count} lanes, have {}",
                cursor.remaining()
            )));
        }

        let mut lanes = Vec::with_capacity(lane_count as usize);
        for _ in 0..lane_count {
            let address = cursor.get_u64_le();
            let value = match kind {
                RecordKind::Default => cursor.get_u64_le(),
                RecordKind::AddressOnly => 0,
            };
            lanes.push(Lane { address, value });
        }

        records.push(AccessRecord {
            thread_id,
            pc,
            flags,
            lanes,
        });
    }
    Ok(records)
}

/// Classifies an otherwise-unresolved address by the addressing-space tag
/// carried in the instruction's opcode string. There is no vendor-neutral address-range
/// encoding for shared/local/constant windows, so this engine relies on
/// the opcode text rather than guessing from the raw address.
fn classify_pseudo(op: &str) -> u64 {
    if op.contains("SHARED") {
        memory::SHARED_ID
    } else if op.contains("LOCAL") {
        memory::LOCAL_ID
    } else if op.contains("CONST") {
        memory::CONSTANT_ID
    } else {
        memory::HOST_ID
    }
}

/// Fans decoded trace records out to every enabled analyzer. Owns no
/// registries itself; borrows the engine's shared `CubinTable` and
/// `MemoryTable` for the lifetime of one `analyze` call.
pub struct Dispatcher {
    analyzers: Vec<Arc<dyn Analyzer>>,
    /// `(cpu_thread, kernel_id) -> previous record's thread`. A pure
    /// function of `ThreadId` alone (`flat_block_id`) cannot tell blocks
    /// apart across records, since every `ThreadId` always maps to the
    /// same block id; the boundary is a property of the *stream*, not of
    /// one thread, so the key must not include `ThreadId`.
    last_block: Mutex<HashMap<(u32, u64), ThreadId>>,
}

impl Dispatcher {
    pub fn new(analyzers: Vec<Arc<dyn Analyzer>>) -> Self {
        Self {
            analyzers,
            last_block: Mutex::new(HashMap::new()),
        }
    }

    pub fn analyzers(&self) -> &[Arc<dyn Analyzer>] {
        &self.analyzers
    }

    #[allow(clippy::too_many_arguments)]
    pub fn analyze(
        &self,
        cpu_thread: u32,
        kernel_id: u64,
        kernel: &KernelOp,
        cubins: &CubinTable,
        memories: &MemoryTable,
        config: &Config,
        metrics: &Metrics,
        buf: &[u8],
        record_count: u32,
        record_kind: RecordKind,
    ) -> Result<()> {
        for analyzer in &self.analyzers {
            analyzer.analysis_begin(cpu_thread, kernel_id, kernel);
        }

        let records = decode_records(buf, record_kind, record_count)?;

        let cubin: Option<Arc<Cubin>> = cubins.get(kernel.cubin_id);

        for record in &records {
            self.handle_block_boundary(cpu_thread, kernel_id, record.thread_id);

            let instruction = cubin.as_ref().and_then(|c| {
                c.module(kernel.mod_id)
                    .and_then(|m| m.instructions.node(record.pc))
            });

            let instruction_op = instruction.map(|inst| inst.op.clone());
            let access_kind = instruction.and_then(|inst| inst.access_kind());

            let access_kind = match access_kind {
                Some(ak) if ak.is_resolved() => ak,
                _ => {
                    metrics.record_unresolved_access();
                    continue;
                }
            };

            let is_read = record.flags & FLAG_READ != 0;
            let is_write = record.flags & FLAG_WRITE != 0;
            if !is_read && !is_write {
                continue;
            }

            for (index, lane) in record.lanes.iter().enumerate() {
                let unit_bytes = (access_kind.unit_size / 8).max(1) as u64;
                let memory = memories.find(lane.address).unwrap_or_else(|| {
                    let ctx = instruction_op
                        .as_deref()
                        .map(classify_pseudo)
                        .unwrap_or(memory::HOST_ID);
                    Arc::new(Memory::new(
                        ctx,
                        ctx as i32,
                        MemoryRange::new(lane.address, lane.address + unit_bytes),
                    ))
                });

                for lane_unit in 0..access_kind.vec_size / access_kind.unit_size.max(1) {
                    // The wire format carries only a single u64 `value` per
                    // lane. A vector access wider than 64 bits (e.g. a
                    // `.128` load inferred to 32-bit units) has no
                    // wire-carried value for units past the first 64 bits;
                    // stop rather than reading a value that was never
                    // transmitted.
                    let shift = u64::from(lane_unit) * u64::from(access_kind.unit_size);
                    if shift >= 64 {
                        break;
                    }
                    let unit_addr = lane.address + u64::from(lane_unit) * unit_bytes;
                    let value = if access_kind.unit_size >= 64 {
                        lane.value
                    } else {
                        (lane.value >> shift) & ((1u64 << access_kind.unit_size) - 1)
                    };

                    let access = UnitAccess {
                        kernel_id,
                        thread_id: record.thread_id,
                        access_kind,
                        memory: memory.clone(),
                        pc: record.pc,
                        value,
                        is_read,
                        unit_addr,
                        index: index as u32,
                    };
                    for analyzer in &self.analyzers {
                        analyzer.unit_access(cpu_thread, kernel_id, &access);
                    }
                }
            }
        }

        for analyzer in &self.analyzers {
            analyzer.analysis_end(cpu_thread, kernel_id);
        }

        Ok(())
    }

    fn handle_block_boundary(&self, cpu_thread: u32, kernel_id: u64, thread_id: ThreadId) {
        let key = (cpu_thread, kernel_id);
        // Always advance to this record's thread so `prev` on the next call
        // is the literal previous record, not just the one at the last
        // detected transition.
        let prev = self.last_block.lock().unwrap().insert(key, thread_id);
        match prev {
            Some(prev) if prev.flat_block_id() == thread_id.flat_block_id() => {}
            Some(prev) => {
                for analyzer in &self.analyzers {
                    analyzer.block_exit(cpu_thread, kernel_id, prev);
                }
                for analyzer in &self.analyzers {
                    analyzer.block_enter(cpu_thread, kernel_id, thread_id);
                }
            }
            None => {
                for analyzer in &self.analyzers {
                    analyzer.block_enter(cpu_thread, kernel_id, thread_id);
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.last_block.lock().unwrap().is_empty() {
            warn!("dispatcher dropped with outstanding block state");
        }
    }
}
