//! The module for the forkvm CLI commands.

mod bench;
mod run;

pub use self::{bench::*, run::*};
