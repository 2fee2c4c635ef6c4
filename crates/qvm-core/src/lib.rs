//! # QVM Core
//!
//! Loading, sandboxing and calling game modules.
//!
//! A [`ModuleRegistry`] owns up to [`MAX_VM`] modules. Each one runs as a
//! host shared library (native), as Cranelift-compiled code, or in the
//! bytecode interpreter. Bytecode modules live in a power-of-two
//! [`Sandbox`]: every address they touch is masked into it.
//!
//! Host code calls modules with [`ModuleRegistry::call`]; modules call back
//! through the [`SyscallHandler`] given at creation, which may in turn call
//! any module again.
//!
//! ## Features
//!
//! - `jit` (default): compile bytecode with `qvm-jit`. Without it every
//!   bytecode module is interpreted.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bridge;
#[cfg(feature = "jit")]
pub mod compiled;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod instance;
mod interpreter;
pub mod loader;
pub mod memory;
pub mod native;
pub mod registry;
pub mod source;
pub mod symbols;

pub use bridge::{CallArgs, SyscallArgs, SyscallContext, SyscallHandler, syscall_fn};
#[cfg(feature = "jit")]
pub use compiled::{CraneliftTranslator, Translator};
#[cfg(feature = "jit")]
pub use qvm_jit::{CompiledProgram, JitError, TranslateOptions};
pub use config::{ExecutionMode, VmConfig};
pub use diagnostics::{ModuleInfo, RegistryInfo};
pub use error::{Severity, VmError, VmResult};
pub use instance::{ModuleInstance, VmHandle};
pub use memory::Sandbox;
pub use native::{DylibLoader, NativeError, NativeLoader, NativeModule};
pub use registry::{MAX_VM, ModuleRegistry};
pub use source::{DirectorySource, ImageSource, MemorySource};
pub use symbols::{SymbolName, SymbolTable};

pub use qvm_bytecode::{Fault, ImageBuilder, Opcode};
pub use qvm_profiler::ProfileReport;
