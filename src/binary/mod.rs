//! The shared binary/instruction model.

mod access_kind;
mod cubin;
mod graph;
mod instruction;
mod symbol;

pub use access_kind::{AccessKind, DataType};
pub use cubin::Cubin;
pub use graph::{EdgeEndpoints, Graph};
pub use instruction::{Instruction, InstructionGraph};
pub use symbol::{Symbol, SymbolVector};
