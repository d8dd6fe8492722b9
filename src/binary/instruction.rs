//! `Instruction`, `InstructionGraph`, and the access-kind inference walk.
//!
//! Grounded on `original_source/include/binutils/instruction.h` and
//! `original_source/src/binutils/instruction.cpp`.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};

use super::access_kind::{AccessKind, DataType};
use super::graph::Graph;

/// Edge payload for the instruction dependency graph. The original source
/// carries only whether the dependency crosses a function boundary; the
/// walk below does not need more than the edge's existence, but the field
/// is kept for parity with `original_source/include/binutils/instruction.h`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionDependency {
    pub inter_function: bool,
}

/// (pc, opcode_tag, predicate, dsts, srcs, assign_pcs). `assign_pcs` maps a
/// source register to the pcs of the instructions that produced the value
/// currently in it.
#[derive(Debug)]
pub struct Instruction {
    pub pc: u64,
    pub op: String,
    pub predicate: i32,
    pub dsts: Vec<u32>,
    pub srcs: Vec<u32>,
    pub uniform_dsts: Vec<u32>,
    pub uniform_srcs: Vec<u32>,
    pub assign_pcs: HashMap<u32, Vec<u64>>,
    access_kind: Cell<Option<AccessKind>>,
}

impl Instruction {
    pub fn new(
        pc: u64,
        op: String,
        predicate: i32,
        dsts: Vec<u32>,
        srcs: Vec<u32>,
        assign_pcs: HashMap<u32, Vec<u64>>,
    ) -> Self {
        Self {
            pc,
            op,
            predicate,
            dsts,
            srcs,
            uniform_dsts: Vec::new(),
            uniform_srcs: Vec::new(),
            assign_pcs,
            access_kind: Cell::new(None),
        }
    }

    pub fn with_uniform(mut self, uniform_dsts: Vec<u32>, uniform_srcs: Vec<u32>) -> Self {
        self.uniform_dsts = uniform_dsts;
        self.uniform_srcs = uniform_srcs;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.op.starts_with("MEMORY")
    }

    pub fn is_load(&self) -> bool {
        self.is_memory() && self.op.contains(".LOAD")
    }

    pub fn is_store(&self) -> bool {
        self.is_memory() && self.op.contains(".STORE")
    }

    pub fn is_shared_or_local(&self) -> bool {
        self.op.contains(".SHARED") || self.op.contains(".LOCAL")
    }

    pub fn access_kind(&self) -> Option<AccessKind> {
        self.access_kind.get()
    }

    pub fn set_access_kind(&self, kind: AccessKind) {
        self.access_kind.set(Some(kind));
    }

    /// Source registers that determine the *value* being stored, excluding
    /// the address-computation sources.
    pub fn value_srcs(&self) -> &[u32] {
        if !self.is_store() {
            return &self.srcs;
        }
        let skip = if self.is_shared_or_local() { 1 } else { 2 };
        if self.srcs.len() > skip {
            &self.srcs[skip..]
        } else {
            &[]
        }
    }
}

pub type InstructionGraph = Graph<u64, Instruction, (u64, u64), InstructionDependency>;

/// Adds one dependency edge per `assign_pcs[src] = {producer_pcs}` pair
/// found on `inst`, from each producer pc to `inst.pc`.
pub fn add_dependency_edges(graph: &mut InstructionGraph, inst_pc: u64) {
    let value_srcs: Vec<u32> = graph.node(inst_pc).unwrap().value_srcs().to_vec();
    let assign_pcs = graph.node(inst_pc).unwrap().assign_pcs.clone();
    for src in value_srcs {
        if let Some(producer_pcs) = assign_pcs.get(&src) {
            for &producer_pc in producer_pcs {
                if graph.has_node(producer_pc) {
                    graph.add_edge((producer_pc, inst_pc), InstructionDependency::default());
                }
            }
        }
    }
}

fn opcode_size_hint(op: &str) -> Option<u32> {
    for (token, size) in [(".128", 128), (".64", 64), (".32", 32), (".16", 16), (".8", 8)] {
        if op.contains(token) {
            return Some(size);
        }
    }
    None
}

struct Partial {
    data_type: DataType,
    vec_size: u32,
    unit_size: u32,
}

impl Partial {
    fn from_opcode(op: &str) -> Self {
        Self {
            data_type: DataType::Unknown,
            vec_size: opcode_size_hint(op).unwrap_or(32),
            unit_size: 0,
        }
    }

    fn resolved(&self) -> bool {
        self.data_type != DataType::Unknown && self.unit_size != 0
    }

    fn finalize(self, default_data_type: DataType) -> AccessKind {
        let unit_size = if self.unit_size == 0 {
            self.vec_size
        } else {
            self.unit_size
        };
        let data_type = if self.data_type == DataType::Unknown {
            default_data_type
        } else {
            self.data_type
        };
        AccessKind::new(data_type, self.vec_size, unit_size)
    }
}

/// Bounded-depth graph walk inferring the `AccessKind` of the memory
/// instruction at `pc`: explores outgoing edges (consumers) for a LOAD,
/// incoming edges (producers) for a STORE. A visited set prevents cycles;
/// MOVE neighbors are transit nodes re-walked without caching; MEMORY
/// neighbors back-infer their own `AccessKind` (reversing direction) and
/// contribute it upward.
fn walk_infer(
    graph: &InstructionGraph,
    pc: u64,
    visited: &mut HashSet<u64>,
    load: bool,
    default_data_type: DataType,
    partial: &mut Partial,
) {
    let neighbor_pcs: Vec<u64> = if load {
        graph.outgoing_nodes(pc).map(|e| e.1).collect()
    } else {
        graph.incoming_nodes(pc).map(|e| e.0).collect()
    };
    if neighbor_pcs.is_empty() {
        return;
    }

    let inst_dsts = graph.node(pc).map(|i| i.dsts.clone()).unwrap_or_default();

    for npc in neighbor_pcs {
        if visited.contains(&npc) {
            continue;
        }
        visited.insert(npc);
        let Some(neighbor) = graph.node(npc) else {
            continue;
        };
        let nop = neighbor.op.as_str();

        if partial.unit_size == 0 {
            if let Some(hint) = opcode_size_hint(nop) {
                if nop.contains("_64_TO_32") {
                    partial.unit_size = if load { 32 } else { 64 };
                } else if nop.contains("_32_TO_64") {
                    partial.unit_size = if load { 64 } else { 32 };
                } else {
                    partial.unit_size = hint.min(partial.vec_size.max(hint));
                }
            }
        }

        if nop.contains("MOVE") {
            walk_infer(graph, npc, visited, load, default_data_type, partial);
        } else if neighbor.is_memory() {
            let reg_matches = if neighbor.is_shared_or_local() {
                neighbor
                    .srcs
                    .first()
                    .is_some_and(|r| inst_dsts.contains(r))
            } else {
                neighbor.srcs.iter().take(2).any(|r| inst_dsts.contains(r))
            };
            if reg_matches {
                if load {
                    if partial.data_type == DataType::Unknown {
                        partial.data_type = DataType::Int;
                    }
                    if partial.unit_size == 0 {
                        partial.unit_size = if neighbor.is_shared_or_local() { 32 } else { 64 };
                    }
                } else {
                    if neighbor.access_kind().is_none() {
                        let mut nvisited = HashSet::new();
                        nvisited.insert(npc);
                        let mut npartial = Partial::from_opcode(nop);
                        walk_infer(graph, npc, &mut nvisited, !load, default_data_type, &mut npartial);
                        neighbor.set_access_kind(npartial.finalize(default_data_type));
                    }
                    if let Some(nak) = neighbor.access_kind() {
                        partial.data_type = nak.data_type;
                        partial.unit_size = nak.unit_size;
                    }
                }
            }
        } else if nop.starts_with("INTEGER") || nop.starts_with("UNIFORM") {
            if partial.data_type == DataType::Unknown {
                partial.data_type = DataType::Int;
            }
        } else if nop.starts_with("FLOAT") {
            if partial.data_type == DataType::Unknown {
                partial.data_type = DataType::Float;
            }
        } else if nop.starts_with("CONVERT") {
            partial.data_type = if nop.contains(".I2F") {
                if load { DataType::Float } else { DataType::Int }
            } else if nop.contains(".F2I") {
                if load { DataType::Int } else { DataType::Float }
            } else if nop.contains(".F2F") {
                DataType::Float
            } else {
                DataType::Int
            };
        } else if partial.data_type == DataType::Unknown {
            partial.data_type = DataType::Int;
        }

        if partial.resolved() {
            break;
        }
    }
}

/// Infers and caches the `AccessKind` of every not-yet-resolved memory
/// instruction in `graph`. Idempotent: re-running on an already-populated
/// graph changes nothing.
pub fn infer_access_kinds(graph: &InstructionGraph, default_data_type: DataType) {
    let targets: Vec<u64> = graph
        .node_indices()
        .filter(|&pc| {
            graph
                .node(pc)
                .is_some_and(|i| i.is_memory() && i.access_kind().is_none())
        })
        .collect();

    for pc in targets {
        let (load, op) = {
            let inst = graph.node(pc).unwrap();
            (inst.is_load(), inst.op.clone())
        };
        let mut visited = HashSet::new();
        visited.insert(pc);
        let mut partial = Partial::from_opcode(&op);
        walk_infer(graph, pc, &mut visited, load, default_data_type, &mut partial);
        graph.node(pc).unwrap().set_access_kind(partial.finalize(default_data_type));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(pc: u64, op: &str, dsts: Vec<u32>, srcs: Vec<u32>) -> Instruction {
        Instruction::new(pc, op.to_string(), 0, dsts, srcs, HashMap::new())
    }

    #[test]
    fn store64_from_float_producer_infers_float64() {
        // STORE.64 reg %r0 <- produced by FLOAT.ADD at pc=10
        let mut g: InstructionGraph = Graph::new();
        let mut store = inst(20, "MEMORY.STORE.64", vec![], vec![99, 1]);
        store.assign_pcs.insert(1, vec![10]);
        g.add_node(10, inst(10, "FLOAT.ADD", vec![1], vec![]));
        g.add_node(20, store);
        add_dependency_edges(&mut g, 20);

        infer_access_kinds(&g, DataType::Int);
        let ak = g.node(20).unwrap().access_kind().unwrap();
        assert_eq!(ak.data_type, DataType::Float);
        assert_eq!(ak.vec_size, 64);
        assert_eq!(ak.unit_size, 64);
    }

    #[test]
    fn unresolved_falls_back_to_default_data_type_and_vec_size() {
        let mut g: InstructionGraph = Graph::new();
        g.add_node(5, inst(5, "MEMORY.LOAD", vec![1], vec![]));
        infer_access_kinds(&g, DataType::Int);
        let ak = g.node(5).unwrap().access_kind().unwrap();
        assert_eq!(ak.data_type, DataType::Int);
        assert_eq!(ak.vec_size, 32);
        assert_eq!(ak.unit_size, 32);
    }

    #[test]
    fn store_address_sources_excluded_from_dependency_edges() {
        let mut g: InstructionGraph = Graph::new();
        let mut store = inst(20, "MEMORY.STORE.SHARED.32", vec![], vec![100, 1]);
        store.assign_pcs.insert(100, vec![1]); // address source, must be excluded
        store.assign_pcs.insert(1, vec![2]); // value source, must be included
        g.add_node(1, inst(1, "INTEGER.IMAD", vec![100], vec![]));
        g.add_node(2, inst(2, "INTEGER.ADD", vec![1], vec![]));
        g.add_node(20, store);
        add_dependency_edges(&mut g, 20);

        assert!(!g.has_edge((1, 20)));
        assert!(g.has_edge((2, 20)));
    }

    #[test]
    fn inference_is_idempotent() {
        let mut g: InstructionGraph = Graph::new();
        g.add_node(5, inst(5, "MEMORY.LOAD.16", vec![1], vec![]));
        infer_access_kinds(&g, DataType::Int);
        let first = g.node(5).unwrap().access_kind();
        infer_access_kinds(&g, DataType::Float); // different default; should not matter, already cached
        let second = g.node(5).unwrap().access_kind();
        assert_eq!(first, second);
    }
}
