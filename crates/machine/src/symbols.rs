use std::collections::HashMap;

/// A named symbol from the program's symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// The symbol closest to some address, and how far into it the address is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Callsite {
    pub name: String,
    pub address: u64,
    pub offset: u64,
    pub size: u64,
}

/// Name and address lookups over a loaded program's symbols.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: HashMap<String, usize>,
    /// Sorted by address.
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(mut symbols: Vec<Symbol>) -> SymbolTable {
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then(a.name.cmp(&b.name)));
        let mut by_name = HashMap::with_capacity(symbols.len());
        for (i, sym) in symbols.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_insert(i);
        }
        SymbolTable { by_name, symbols }
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|i| &self.symbols[*i])
    }

    /// Address of `name`, or zero if there is no such symbol.
    pub fn address_of(&self, name: &str) -> u64 {
        self.get(name).map_or(0, |s| s.address)
    }

    /// Finds the symbol containing `addr`, or the closest one before it.
    pub fn lookup(&self, addr: u64) -> Callsite {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        match idx.checked_sub(1).map(|i| &self.symbols[i]) {
            Some(sym) => Callsite {
                name: sym.name.clone(),
                address: sym.address,
                offset: addr - sym.address,
                size: sym.size,
            },
            None => Callsite {
                name: "(unknown)".to_string(),
                address: 0,
                offset: addr,
                size: 0,
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
