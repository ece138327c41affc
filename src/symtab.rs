//! Opaque name→address lookup, consumed by the core only for diagnostics
//! (`spec.md` §1: "the symbol table ... the core consumes as an opaque
//! name→address lookup"). Populated by the loader from the program
//! image's symbol table section (`spec.md` §6); never written to by the
//! dispatcher.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            by_name: HashMap::new(),
        }
    }

    /// Insert a symbol. Returns `false` without inserting if `name` is
    /// already present -- the loader turns that into a `BadProgramImage`
    /// error (`spec.md` §6: "any symbol entry whose name collides with an
    /// earlier one → Format").
    pub fn insert(&mut self, name: String, address: u64) -> bool {
        if self.by_name.contains_key(&name) {
            return false;
        }
        self.by_name.insert(name, address);
        true
    }

    pub fn address_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// The symbol whose address is the closest one ≤ `addr`, for
    /// diagnostics like "PC is N bytes into `foo`". `None` if every known
    /// symbol's address is greater than `addr`.
    pub fn lookup_nearest(&self, addr: u64) -> Option<(&str, u64)> {
        self.by_name
            .iter()
            .filter(|(_, &a)| a <= addr)
            .max_by_key(|(_, &a)| a)
            .map(|(name, &a)| (name.as_str(), a))
    }
}
