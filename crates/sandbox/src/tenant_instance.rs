use crate::config::TenantConfig;
use crate::error::SandboxError;
use crate::machine_instance::MachineInstance;
use crate::script::{CallResult, Script};
use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use forkvm_machine::{Callsite, Memory, REG_ARG2, REG_ARG3, VBuffer};
use std::fs;
use std::sync::Arc;

/// Size in bytes of one `{ addr, len }` entry in a result table.
const TABLE_ENTRY_SIZE: u64 = 16;

fn read_table_entry(memory: &mut Memory, entry: u64) -> forkvm_machine::Result<(u64, u64)> {
    Ok((memory.read_u64(entry)?, memory.read_u64(entry + 8)?))
}

/// A tenant: its configuration and the program instance currently serving
/// it.
///
/// The instance can be replaced at any time, including while forks of the
/// previous instance are still running.
pub struct TenantInstance {
    config: Arc<TenantConfig>,
    machine: ArcSwapOption<MachineInstance>,
}

impl TenantInstance {
    /// Creates the tenant and loads its program from `config.filename`.
    ///
    /// A program that fails to load or initialize is logged and leaves the
    /// tenant without a program.
    pub fn new(config: TenantConfig) -> TenantInstance {
        let tenant = TenantInstance::empty(config);
        if let Err(e) = tenant.reload() {
            log::error!("{}: {e:?}", tenant.config.name);
        }
        tenant
    }

    /// Like [`TenantInstance::new`], but a program that fails to load is an
    /// error.
    pub fn try_new(config: TenantConfig) -> Result<TenantInstance> {
        let tenant = TenantInstance::empty(config);
        tenant.reload()?;
        Ok(tenant)
    }

    /// Creates the tenant with a program loaded from memory.
    pub fn with_binary(config: TenantConfig, binary: Vec<u8>) -> TenantInstance {
        let tenant = TenantInstance::empty(config);
        if let Err(e) = tenant.reload_from(binary) {
            log::error!("{}: {e:?}", tenant.config.name);
        }
        tenant
    }

    fn empty(config: TenantConfig) -> TenantInstance {
        TenantInstance {
            config: Arc::new(config),
            machine: ArcSwapOption::empty(),
        }
    }

    pub fn config(&self) -> &Arc<TenantConfig> {
        &self.config
    }

    /// A snapshot of the current program instance.
    pub fn current_instance(&self) -> Option<Arc<MachineInstance>> {
        self.machine.load_full()
    }

    pub fn no_program_loaded(&self) -> bool {
        self.machine.load().is_none()
    }

    /// Address of the symbol `name` in the current program, or zero.
    pub fn lookup(&self, name: &str) -> u64 {
        match &*self.machine.load() {
            Some(inst) => inst.lookup(name),
            None => 0,
        }
    }

    /// Describes the function holding the symbol `name`.
    pub fn callsite(&self, name: &str) -> Callsite {
        match &*self.machine.load() {
            Some(inst) => inst.script().callsite(inst.lookup(name)),
            None => Callsite::default(),
        }
    }

    /// Forks the current program instance.
    pub fn vmfork(&self) -> Option<Script> {
        let Some(inst) = self.machine.load_full() else {
            log::debug!("{}: vmfork without a program", self.config.name);
            return None;
        };
        Some(inst.fork())
    }

    /// Forks the current program instance, calls `address` in the fork and
    /// gathers the buffers it published, at most `capacity` of them.
    ///
    /// The guest publishes its result by leaving the address of a table of
    /// `{ u64 addr; u64 len; }` entries in a2 and the number of entries in
    /// a3.
    pub fn forkcall(&self, address: u64, capacity: usize) -> Result<ForkCall, SandboxError> {
        let inst = self
            .machine
            .load_full()
            .ok_or(SandboxError::NoProgramLoaded)?;
        let mut script = inst.fork();
        let result = script.call(address, &[]);

        let machine = script.machine_mut();
        let table = machine.cpu.get(REG_ARG2);
        let count = machine.cpu.get(REG_ARG3);
        let mut buffers = Vec::new();
        let mut truncated = false;
        for i in 0..count.min(capacity as u64) {
            let entry = table.wrapping_add(i * TABLE_ENTRY_SIZE);
            let gathered = read_table_entry(&mut machine.memory, entry).and_then(|(addr, len)| {
                machine
                    .memory
                    .gather_buffers_from_range(&mut buffers, capacity, addr, len)
            });
            match gathered {
                Ok(true) => {}
                Ok(false) => {
                    truncated = true;
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "{}: bad result table entry {i} at {entry:#x}: {e}",
                        self.config.name
                    );
                    break;
                }
            }
        }
        truncated |= count > capacity as u64;
        if truncated {
            log::debug!(
                "{}: result truncated to {} buffers",
                self.config.name,
                buffers.len()
            );
        }

        Ok(ForkCall {
            script,
            buffers,
            truncated,
            result,
        })
    }

    /// Reloads the program from `config.filename`.
    ///
    /// On failure the current instance stays in place.
    pub fn reload(&self) -> Result<()> {
        let filename = &self.config.filename;
        let binary = fs::read(filename)
            .with_context(|| format!("failed to read program: {}", filename.display()))?;
        self.reload_from(binary)
    }

    /// Builds a new instance from `binary` and makes it current.
    ///
    /// On failure the current instance stays in place.
    pub fn reload_from(&self, binary: Vec<u8>) -> Result<()> {
        let inst = MachineInstance::new(Arc::new(binary), self.config.clone())
            .with_context(|| format!("failed to build program for '{}'", self.config.name))?;
        self.install(Arc::new(inst));
        log::debug!("{}: program loaded", self.config.name);
        Ok(())
    }

    /// Makes `instance` current, returning the instance it replaces.
    pub fn install(&self, instance: Arc<MachineInstance>) -> Option<Arc<MachineInstance>> {
        self.machine.swap(Some(instance))
    }

    /// Removes the current instance.
    pub fn unload(&self) -> Option<Arc<MachineInstance>> {
        self.machine.swap(None)
    }
}

/// The outcome of [`TenantInstance::forkcall`].
///
/// The fork is kept open so the gathered buffers can be read straight out
/// of its memory.
pub struct ForkCall {
    script: Script,
    buffers: Vec<VBuffer>,
    truncated: bool,
    result: CallResult,
}

impl ForkCall {
    /// Number of gathered buffers.
    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    /// Contents of buffer `i`.
    pub fn buffer(&self, i: usize) -> Option<&[u8]> {
        let buf = self.buffers.get(i)?;
        Some(self.script.machine().memory.view(buf))
    }

    pub fn buffers(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let memory = &self.script.machine().memory;
        self.buffers.iter().map(move |buf| memory.view(buf))
    }

    /// All gathered bytes, concatenated.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffers().flatten().copied().collect()
    }

    /// Whether the guest published more than fit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// What the guest call returned. The guest's result is published
    /// through the buffers, so callers rarely need this.
    pub fn result(&self) -> &CallResult {
        &self.result
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn script_mut(&mut self) -> &mut Script {
        &mut self.script
    }

    pub fn into_script(self) -> Script {
        self.script
    }
}
