//! Registry and execution errors.

use qvm_bytecode::{BytecodeError, Fault};
use thiserror::Error;

/// How far an error unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the current operation; loaded modules stay usable.
    Drop,
    /// Unrecoverable for the module involved; the host should run
    /// [`crate::ModuleRegistry::recover`].
    Fatal,
}

/// Errors raised by the module registry and the call bridge.
#[derive(Debug, Error)]
pub enum VmError {
    /// Empty module name
    #[error("module name must not be empty")]
    BadParameters,

    /// All registry slots are in use
    #[error("no free slot for module {name}")]
    NoFreeSlot {
        /// Module being created
        name: String,
    },

    /// Image failed validation
    #[error("{file}: {source}")]
    Image {
        /// Image path
        file: String,
        /// Validation failure
        #[source]
        source: BytecodeError,
    },

    /// Reading an image or map file failed
    #[error("{file}: {source}")]
    Io {
        /// File path
        file: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Restart found an image needing a different sandbox size
    #[error("{name}: sandbox size changed on restart ({expected} -> {found})")]
    SizeMismatch {
        /// Module name
        name: String,
        /// Allocated size
        expected: u32,
        /// Size the image now needs
        found: u32,
    },

    /// Handle does not refer to a live module
    #[error("stale module handle")]
    StaleHandle,

    /// `free` on a module with calls in progress
    #[error("cannot free {name} while it is running")]
    FreeWhileRunning {
        /// Module name
        name: String,
    },

    /// Operation not allowed while a call is in progress
    #[error("{name} is running")]
    Running {
        /// Module name
        name: String,
    },

    /// Bytecode fault
    #[error("{module}: {fault} at instruction {pc} ({symbol})")]
    Fault {
        /// Module name
        module: String,
        /// Fault kind
        fault: Fault,
        /// Instruction index
        pc: i32,
        /// Symbol containing `pc`, or a diagnostic marker
        symbol: String,
    },

    /// Error raised by a syscall handler
    #[error("syscall handler failed: {0}")]
    Host(String),

    /// Memory accessor used on a module without a sandbox
    #[error("{name} is a native module and has no sandboxed memory")]
    NotSandboxed {
        /// Module name
        name: String,
    },

    /// Restart could not bring the module back
    #[error("restart of {name} failed")]
    RestartFailed {
        /// Module name
        name: String,
    },

    /// The module was force-unloaded while one of its calls was running
    #[error("{name} was unloaded during a call")]
    InstanceGone {
        /// Module name
        name: String,
    },
}

impl VmError {
    /// Classify the error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Fault { .. } | Self::Host(_) | Self::InstanceGone { .. } => Severity::Drop,
            Self::NotSandboxed { .. } | Self::RestartFailed { .. } => Severity::Drop,
            _ => Severity::Fatal,
        }
    }
}

/// Result type for registry operations
pub type VmResult<T> = Result<T, VmError>;
