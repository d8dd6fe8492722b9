//! Thread-safe registries, one coarse mutex per structure
//!, grounded on `cognitod/src/context.rs`'s
//! `Mutex<HashMap<...>>` pattern and `original_source/include/common/map.h`'s
//! `LockableMap::prev`.

mod cubin_table;
mod memory_table;
mod op_node_table;

pub use cubin_table::CubinTable;
pub use memory_table::MemoryTable;
pub use op_node_table::OpNodeTable;
