use thiserror::Error;

/// Errors returned by tenant operations that do not reach the guest.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxError {
    /// The tenant has no program instance installed.
    #[error("No program loaded")]
    NoProgramLoaded,
}
