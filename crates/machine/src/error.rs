use thiserror::Error;

/// Errors raised while loading or running a guest.
///
/// Everything except [`MachineError::Timeout`] is a fault of some kind; the
/// distinction matters to callers who treat running out of budget differently
/// from a guest that crashed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// The instruction budget ran out before the guest halted.
    #[error("instruction limit of {max} reached")]
    Timeout { max: u64 },

    /// A load or store touched memory the guest may not access.
    #[error("protection fault at {addr:#x}")]
    ProtectionFault { addr: u64 },

    /// The guest tried to grow past its address-space ceiling.
    #[error("out of memory at {addr:#x}")]
    OutOfMemory { addr: u64 },

    /// The instruction could not be decoded.
    #[error("illegal instruction {bits:#010x}")]
    IllegalInstruction { bits: u32 },

    /// The program counter was not aligned to an instruction boundary.
    #[error("misaligned instruction at {pc:#x}")]
    MisalignedInstruction { pc: u64 },

    /// The program counter left executable memory.
    #[error("execution space protection fault at {pc:#x}")]
    ExecutionSpaceProtection { pc: u64 },

    /// A call was set up with more arguments than there are argument
    /// registers.
    #[error("too many arguments for a guest call")]
    TooManyArguments,

    /// The binary could not be loaded.
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// A system call rejected its arguments.
    #[error("{message}")]
    Guest { message: String, data: u64 },
}

impl MachineError {
    /// Auxiliary data attached to the error, usually the offending address.
    pub fn data(&self) -> u64 {
        match *self {
            MachineError::Timeout { max } => max,
            MachineError::ProtectionFault { addr } | MachineError::OutOfMemory { addr } => addr,
            MachineError::IllegalInstruction { bits } => u64::from(bits),
            MachineError::MisalignedInstruction { pc }
            | MachineError::ExecutionSpaceProtection { pc } => pc,
            MachineError::Guest { data, .. } => data,
            MachineError::TooManyArguments | MachineError::InvalidProgram(_) => 0,
        }
    }

    /// Whether this error means the instruction budget was exhausted.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MachineError::Timeout { .. })
    }

    pub(crate) fn guest(message: impl Into<String>, data: u64) -> MachineError {
        MachineError::Guest {
            message: message.into(),
            data,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T, E = MachineError> = core::result::Result<T, E>;
