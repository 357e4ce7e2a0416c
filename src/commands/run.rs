//! The module that implements the `forkvm run` command.

use anyhow::{Result, bail};
use clap::Parser;
use forkvm::{CallResult, DEFAULT_MAX_HEAP, DEFAULT_MAX_INSTRUCTIONS, DEFAULT_MAX_MEMORY};
use forkvm::{TenantConfig, TenantInstance};
use std::io::Write;
use std::path::PathBuf;

/// Runs one request against a guest program
#[derive(Parser)]
pub struct RunCommand {
    /// The name of the function to call in a fresh fork
    #[arg(long, value_name = "FUNCTION", default_value = "on_client_request")]
    invoke: String,

    /// The tenant name, passed to the guest as `argv[0]`
    #[arg(long, default_value = "Pythran")]
    name: String,

    /// The tenant group
    #[arg(long, default_value = "Tenants")]
    group: String,

    /// Instruction budget for initialization and for the call
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_INSTRUCTIONS)]
    max_instructions: u64,

    /// Size of the guest address space in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_MEMORY)]
    max_memory: u64,

    /// Size of the guest's native heap in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_HEAP)]
    max_heap: u64,

    /// The most result buffers to gather
    #[arg(long, value_name = "N", default_value_t = 64)]
    buffers: usize,

    /// The RISC-V program to run
    #[arg(required = true, value_name = "PROGRAM")]
    program: PathBuf,
}

impl RunCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        crate::init_logging();

        let config = TenantConfig::new(self.name, self.group, self.program)
            .with_max_instructions(self.max_instructions)
            .with_max_memory(self.max_memory)
            .with_max_heap(self.max_heap);
        let tenant = TenantInstance::try_new(config)?;

        let address = tenant.lookup(&self.invoke);
        if address == 0 {
            bail!("failed to find function `{}`", self.invoke);
        }
        let call = tenant.forkcall(address, self.buffers)?;
        match call.result() {
            CallResult::Returned(value) => log::debug!("`{}` returned {value}", self.invoke),
            CallResult::Timeout => bail!(
                "`{}` exceeded {} instructions",
                self.invoke,
                self.max_instructions
            ),
            CallResult::Fault(report) => bail!("`{}` faulted: {}", self.invoke, report.error),
        }

        if let Some(buffer) = call.buffer(0) {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(buffer)?;
            stdout.flush()?;
        }
        Ok(())
    }
}
