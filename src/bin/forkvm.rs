//! The `forkvm` command line tool.
//!
//! Runs RISC-V guest programs in forks of an initialized template.
//! See `forkvm --help` for usage.

use anyhow::Result;
use clap::Parser;

/// Template-and-fork sandbox for RISC-V guest programs
#[derive(Parser)]
#[command(
    name = "forkvm",
    version,
    after_help = "Usage examples:\n\
                  \n\
                  Running the request handler of a program once:\n\
                  \n  \
                  forkvm run hello.elf\n\
                  \n\
                  Calling a specific function with a smaller budget:\n\
                  \n  \
                  forkvm run --invoke get_counter --max-instructions 10000 hello.elf\n\
                  \n\
                  Driving the tenants of a configuration file from 4 threads:\n\
                  \n  \
                  forkvm bench --config tenants.toml --threads 4\n"
)]
struct Forkvm {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Runs one request against a guest program
    Run(forkvm_cli::commands::RunCommand),

    /// Drives requests against configured tenants from several threads
    Bench(forkvm_cli::commands::BenchCommand),
}

impl Forkvm {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        match self.subcommand {
            Subcommand::Run(c) => c.execute(),
            Subcommand::Bench(c) => c.execute(),
        }
    }
}

fn main() -> Result<()> {
    Forkvm::parse().execute()
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Forkvm::command().debug_assert()
}
