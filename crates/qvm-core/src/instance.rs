//! Loaded modules and the handles that name them.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use qvm_bytecode::{Header, Program};
use qvm_profiler::CallProfile;
use serde::Serialize;

use crate::bridge::SyscallHandler;
use crate::config::ExecutionMode;
use crate::memory::Sandbox;
use crate::native::NativeModule;
use crate::symbols::SymbolTable;

/// Names a registry slot at one point in its life.
///
/// The generation changes whenever the slot is freed, so a handle kept past
/// `free` is detected instead of silently reaching the slot's next module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct VmHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl VmHandle {
    /// Registry slot index.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

/// Bytecode module state shared by the interpreter and compiled backends.
pub(crate) struct BytecodeModule {
    pub header: Header,
    pub program: Rc<Program>,
    pub sandbox: Sandbox,
    pub program_stack: i32,
    pub stack_bottom: i32,
    /// Instruction of the most recent syscall or fault
    pub last_pc: Option<i32>,
    pub profile: Option<Arc<CallProfile>>,
    #[cfg(feature = "jit")]
    pub compiled: Option<Rc<qvm_jit::CompiledProgram>>,
}

impl BytecodeModule {
    pub fn mode(&self) -> ExecutionMode {
        #[cfg(feature = "jit")]
        if self.compiled.is_some() {
            return ExecutionMode::Compiled;
        }
        ExecutionMode::Interpreted
    }
}

/// Execution backend chosen at load.
pub(crate) enum Backend {
    Native(NativeModule),
    Bytecode(BytecodeModule),
}

/// Symbol table state: loaded on first use.
pub(crate) enum Symbols {
    Unloaded,
    Missing,
    Loaded(SymbolTable),
}

impl Symbols {
    pub fn table(&self) -> Option<&SymbolTable> {
        match self {
            Self::Loaded(table) => Some(table),
            _ => None,
        }
    }
}

/// One loaded module, owned by the registry.
pub struct ModuleInstance {
    pub(crate) name: Rc<str>,
    pub(crate) handler: Rc<dyn SyscallHandler>,
    pub(crate) backend: Backend,
    pub(crate) call_level: u32,
    pub(crate) symbols: Symbols,
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("call_level", &self.call_level)
            .finish_non_exhaustive()
    }
}

impl ModuleInstance {
    /// Module name as given to `create`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend in use.
    pub fn mode(&self) -> ExecutionMode {
        match &self.backend {
            Backend::Native(_) => ExecutionMode::Native,
            Backend::Bytecode(module) => module.mode(),
        }
    }

    /// Calls in progress.
    pub fn call_level(&self) -> u32 {
        self.call_level
    }

    /// Whether a call is in progress.
    pub fn is_running(&self) -> bool {
        self.call_level > 0
    }

    /// Sandbox of a bytecode module.
    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.bytecode().map(|m| &m.sandbox)
    }

    /// Segment size minus one (bytecode modules).
    pub fn data_mask(&self) -> Option<u32> {
        self.bytecode().map(|m| m.sandbox.mask())
    }

    /// Current program stack pointer (bytecode modules).
    pub fn program_stack(&self) -> Option<i32> {
        self.bytecode().map(|m| m.program_stack)
    }

    /// Lowest legal program stack value (bytecode modules).
    pub fn stack_bottom(&self) -> Option<i32> {
        self.bytecode().map(|m| m.stack_bottom)
    }

    /// Instruction of the most recent syscall or fault (bytecode modules).
    pub fn last_pc(&self) -> Option<i32> {
        self.bytecode().and_then(|m| m.last_pc)
    }

    /// Parsed image header (bytecode modules).
    pub fn header(&self) -> Option<&Header> {
        self.bytecode().map(|m| &m.header)
    }

    /// Decoded program (bytecode modules).
    pub fn program(&self) -> Option<&Program> {
        self.bytecode().map(|m| m.program.as_ref())
    }

    /// Symbols, if a map file has been loaded.
    pub fn symbol_table(&self) -> Option<&SymbolTable> {
        self.symbols.table()
    }

    pub(crate) fn bytecode(&self) -> Option<&BytecodeModule> {
        match &self.backend {
            Backend::Bytecode(module) => Some(module),
            Backend::Native(_) => None,
        }
    }

    pub(crate) fn bytecode_mut(&mut self) -> Option<&mut BytecodeModule> {
        match &mut self.backend {
            Backend::Bytecode(module) => Some(module),
            Backend::Native(_) => None,
        }
    }
}
