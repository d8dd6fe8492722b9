//! Symbol resolution, grounded on
//! `original_source/include/binutils/{symbol,real_pc}.h`.

/// (function_index, binary_offset, runtime_pc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub function_index: u32,
    pub binary_offset: u64,
    pub runtime_pc: u64,
}

/// Ordered ascending by `runtime_pc`.
#[derive(Debug, Clone, Default)]
pub struct SymbolVector {
    symbols: Vec<Symbol>,
}

impl SymbolVector {
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.runtime_pc);
        Self { symbols }
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Upper-bound lookup: returns `(function_index, pc_offset)` for the
    /// symbol whose `runtime_pc` is the largest value `<= runtime_pc`.
    pub fn transform_pc(&self, runtime_pc: u64) -> Option<(u32, u64)> {
        let idx = self
            .symbols
            .partition_point(|s| s.runtime_pc <= runtime_pc);
        if idx == 0 {
            return None;
        }
        let found = &self.symbols[idx - 1];
        let pc_offset = runtime_pc - found.runtime_pc + found.binary_offset;
        Some((found.function_index, pc_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sv() -> SymbolVector {
        SymbolVector::new(vec![
            Symbol {
                function_index: 0,
                binary_offset: 0x100,
                runtime_pc: 0x1000,
            },
            Symbol {
                function_index: 1,
                binary_offset: 0x200,
                runtime_pc: 0x2000,
            },
        ])
    }

    #[test]
    fn resolves_exact_and_interior_pcs() {
        let sv = sv();
        assert_eq!(sv.transform_pc(0x1000), Some((0, 0x100)));
        assert_eq!(sv.transform_pc(0x1010), Some((0, 0x110)));
        assert_eq!(sv.transform_pc(0x2050), Some((1, 0x250)));
    }

    #[test]
    fn below_first_symbol_is_unresolved() {
        let sv = sv();
        assert_eq!(sv.transform_pc(0x500), None);
    }
}
