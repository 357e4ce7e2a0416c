use crate::config::TenantConfig;
use crate::script::Script;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Entry points resolved when an instance is built.
pub const LOOKUP_WISHLIST: [&str; 2] = ["on_init", "on_client_request"];

/// A resolved entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    /// Zero if the program does not define the symbol.
    pub address: u64,
    /// Size of the function at `address`.
    pub size: u64,
}

/// A loaded program: its binary, the initialized template every fork is
/// derived from, and a lookup table for the common entry points.
///
/// Instances are shared through `Arc`. The tenant's slot holds one reference
/// and every fork holds another, so an instance that has been replaced stays
/// alive until its last fork is gone.
pub struct MachineInstance {
    binary: Arc<Vec<u8>>,
    script: Script,
    sym_lookup: HashMap<String, SymbolEntry>,
    sym_vector: Vec<SymbolEntry>,
}

impl MachineInstance {
    /// Builds the template for `binary` and runs its initialization.
    pub fn new(binary: Arc<Vec<u8>>, config: Arc<TenantConfig>) -> Result<MachineInstance> {
        let script = Script::new_template(&binary, config)?;
        let mut sym_lookup = HashMap::new();
        let mut sym_vector = Vec::with_capacity(LOOKUP_WISHLIST.len());
        for name in LOOKUP_WISHLIST {
            let address = script.resolve_address(name);
            if address == 0 {
                log::debug!("{}: unresolved symbol '{name}'", script.name());
            }
            let entry = SymbolEntry {
                name: name.to_string(),
                address,
                size: script.callsite(address).size,
            };
            sym_lookup.insert(entry.name.clone(), entry.clone());
            sym_vector.push(entry);
        }
        Ok(MachineInstance {
            binary,
            script,
            sym_lookup,
            sym_vector,
        })
    }

    /// Address of the symbol `name`, or zero if the program has none.
    pub fn lookup(&self, name: &str) -> u64 {
        match self.sym_lookup.get(name) {
            Some(entry) => entry.address,
            None => self.script.resolve_address(name),
        }
    }

    /// The entry points resolved at construction.
    pub fn symbols(&self) -> &[SymbolEntry] {
        &self.sym_vector
    }

    /// The template.
    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn binary(&self) -> &Arc<Vec<u8>> {
        &self.binary
    }

    pub fn config(&self) -> &Arc<TenantConfig> {
        self.script.config()
    }

    /// Creates a fresh fork of the template.
    pub fn fork(self: &Arc<Self>) -> Script {
        Script::new_fork(self.clone())
    }
}
