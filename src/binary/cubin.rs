//! `Cubin` — a registered, parsed GPU binary unit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{RedshowError, Result};

use super::access_kind::DataType;
use super::graph::Graph;
use super::instruction::{add_dependency_edges, infer_access_kinds, Instruction, InstructionGraph};
use super::symbol::{Symbol, SymbolVector};

#[derive(Debug, Deserialize)]
struct SrcRegister {
    id: u32,
    #[serde(default)]
    assign_pcs: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct InstJson {
    pc: u64,
    op: String,
    #[serde(default)]
    pred: i32,
    #[serde(default)]
    dsts: Vec<u32>,
    #[serde(default)]
    srcs: Vec<SrcRegister>,
    #[serde(default)]
    udsts: Vec<u32>,
    #[serde(default)]
    usrcs: Vec<SrcRegister>,
}

#[derive(Debug, Deserialize)]
struct BlockJson {
    insts: Vec<InstJson>,
}

#[derive(Debug, Deserialize)]
struct FunctionJson {
    index: u32,
    address: u64,
    blocks: Vec<BlockJson>,
}

/// One module's worth of parsed binary: symbol table plus the instruction
/// dependency graph, with every memory instruction's `AccessKind` already
/// resolved.
#[derive(Debug)]
pub struct CubinModule {
    pub symbols: SymbolVector,
    pub instructions: InstructionGraph,
}

/// (cubin_id, path, mod_id → SymbolVector, InstructionGraph). Immutable
/// after registration.
#[derive(Debug)]
pub struct Cubin {
    pub cubin_id: u32,
    pub path: PathBuf,
    mods: HashMap<u32, CubinModule>,
}

impl Cubin {
    /// Parses the cubin JSON schema at `path` and registers
    /// it under `mod_id`. Mmaps the file read-only before deserializing,
    /// the same ring-buffer mapping technique `cognitod`'s sequencer uses,
    /// repurposed here for a static file (see DESIGN.md).
    pub fn parse(cubin_id: u32, mod_id: u32, path: &Path, default_data_type: DataType) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|_| RedshowError::FileNotFound(path.to_path_buf()))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| RedshowError::CubinParseFailed(e.into()))?;
        let functions: Vec<FunctionJson> =
            serde_json::from_slice(&mmap).map_err(|e| RedshowError::CubinParseFailed(e.into()))?;

        let module = build_module(&functions, default_data_type);
        let mut mods = HashMap::new();
        mods.insert(mod_id, module);

        Ok(Self {
            cubin_id,
            path: path.to_path_buf(),
            mods,
        })
    }

    pub fn module(&self, mod_id: u32) -> Option<&CubinModule> {
        self.mods.get(&mod_id)
    }

    pub fn add_module(&mut self, mod_id: u32, module: CubinModule) {
        self.mods.insert(mod_id, module);
    }

    /// Constructs a `Cubin` with no modules, for registry tests that only
    /// exercise id bookkeeping rather than instruction parsing.
    #[cfg(test)]
    pub fn empty_for_test(cubin_id: u32, path: PathBuf) -> Self {
        Self {
            cubin_id,
            path,
            mods: HashMap::new(),
        }
    }
}

fn build_module(functions: &[FunctionJson], default_data_type: DataType) -> CubinModule {
    let mut symbols = Vec::new();
    let mut graph: InstructionGraph = Graph::new();

    for func in functions {
        symbols.push(Symbol {
            function_index: func.index,
            binary_offset: 0,
            runtime_pc: func.address,
        });
        for block in &func.blocks {
            for inst in &block.insts {
                let mut assign_pcs = HashMap::new();
                let mut srcs = Vec::with_capacity(inst.srcs.len());
                for s in &inst.srcs {
                    srcs.push(s.id);
                    if !s.assign_pcs.is_empty() {
                        assign_pcs.insert(s.id, s.assign_pcs.clone());
                    }
                }
                let mut usrcs = Vec::with_capacity(inst.usrcs.len());
                for s in &inst.usrcs {
                    usrcs.push(s.id);
                    if !s.assign_pcs.is_empty() {
                        assign_pcs.insert(s.id, s.assign_pcs.clone());
                    }
                }
                let instruction = Instruction::new(
                    inst.pc,
                    inst.op.clone(),
                    inst.pred,
                    inst.dsts.clone(),
                    srcs,
                    assign_pcs,
                )
                .with_uniform(inst.udsts.clone(), usrcs);
                graph.add_node(inst.pc, instruction);
            }
        }
    }

    for func in functions {
        for block in &func.blocks {
            for inst in &block.insts {
                add_dependency_edges(&mut graph, inst.pc);
            }
        }
    }

    infer_access_kinds(&graph, default_data_type);

    CubinModule {
        symbols: SymbolVector::new(symbols),
        instructions: graph,
    }
}
