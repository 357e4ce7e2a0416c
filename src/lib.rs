//! The forkvm command line interface (CLI) crate.
//!
//! This crate implements the `forkvm` command line tool.

#![deny(missing_docs)]

pub mod commands;

/// Sends log records to stderr, filtered by the `FORKVM_LOG` environment
/// variable (for example `FORKVM_LOG=forkvm=debug`).
pub fn init_logging() {
    use std::io::IsTerminal;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let b = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_env("FORKVM_LOG"))
        .with_ansi(std::io::stderr().is_terminal());
    // A second initialization (as in tests) keeps the first subscriber.
    let _ = b.try_init();
}
