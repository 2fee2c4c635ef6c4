//! Runtime helper infrastructure for compiled code → host callbacks.
//!
//! Operations that need more than the data segment (syscalls into the host,
//! profiling counters) or that are simply not worth inlining (block copies)
//! are lowered to calls of `extern "C"` helpers imported through Cranelift.
//!
//! # Architecture
//!
//! ```text
//! qvm-jit (defines helper kinds + signatures)
//!       ↑
//! qvm-core (implements helpers, fills RuntimeHelpers)
//! ```
//!
//! # ABI
//!
//! Every helper takes the `*mut JitContext` first, then `i32` operands, and
//! returns an `i32`:
//!
//! | helper      | params             | returns                      |
//! |-------------|--------------------|------------------------------|
//! | `Syscall`   | `(ctx, ps)`        | syscall result               |
//! | `BlockCopy` | `(ctx, dst, src, n)` | 0, or a fault code         |
//! | `Profile`   | `(ctx, pc)`        | ignored                      |
//!
//! `Syscall` reports host failures by setting [`crate::FAULT_HOST`] in the
//! context; compiled code checks the fault word after every syscall.

use cranelift_codegen::ir::{self, AbiParam, Type, types};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::JitError;

/// Identifies a runtime helper function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperKind {
    /// `(ctx, ps) -> result`
    Syscall = 0,
    /// `(ctx, dest, src, len) -> fault code or 0`
    BlockCopy = 1,
    /// `(ctx, pc) -> 0`
    Profile = 2,
}

/// Total number of helper kinds.
pub const HELPER_COUNT: usize = 3;

const ALL: [HelperKind; HELPER_COUNT] =
    [HelperKind::Syscall, HelperKind::BlockCopy, HelperKind::Profile];

impl HelperKind {
    /// Symbol name used for Cranelift import resolution.
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::Syscall => "qvm_rt_syscall",
            Self::BlockCopy => "qvm_rt_block_copy",
            Self::Profile => "qvm_rt_profile",
        }
    }

    /// Number of `i32` parameters after the ctx pointer.
    pub fn operand_count(self) -> usize {
        match self {
            Self::Syscall | Self::Profile => 1,
            Self::BlockCopy => 3,
        }
    }

    /// Build the Cranelift IR signature for this helper.
    pub fn make_signature(self, call_conv: CallConv, pointer_type: Type) -> ir::Signature {
        let mut sig = ir::Signature::new(call_conv);
        sig.params.push(AbiParam::new(pointer_type));
        for _ in 0..self.operand_count() {
            sig.params.push(AbiParam::new(types::I32));
        }
        sig.returns.push(AbiParam::new(types::I32));
        sig
    }
}

/// Table of runtime helper function pointers.
///
/// When a slot is `None`, instructions needing that helper are rejected as
/// unsupported during translation.
#[derive(Clone, Default)]
pub struct RuntimeHelpers {
    ptrs: [Option<*const u8>; HELPER_COUNT],
}

impl RuntimeHelpers {
    /// Create an empty helper table (all helpers unset).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a helper function pointer.
    ///
    /// # Safety
    ///
    /// The function pointer must have the `extern "C"` signature documented
    /// for `kind` in the module docs.
    pub unsafe fn set(&mut self, kind: HelperKind, ptr: *const u8) {
        self.ptrs[kind as usize] = Some(ptr);
    }

    /// Get a helper function pointer.
    pub fn get(&self, kind: HelperKind) -> Option<*const u8> {
        self.ptrs[kind as usize]
    }

    /// Register all non-None helper pointers as symbols on the JIT builder.
    pub fn register_symbols(&self, builder: &mut JITBuilder) {
        for kind in ALL {
            if let Some(ptr) = self.get(kind) {
                builder.symbol(kind.symbol_name(), ptr);
            }
        }
    }
}

/// Module-level function IDs for declared helper imports.
pub(crate) struct HelperFuncIds {
    ids: [Option<FuncId>; HELPER_COUNT],
}

impl HelperFuncIds {
    /// Declare all available helpers as imported functions on the module.
    pub fn declare<M: Module>(helpers: &RuntimeHelpers, module: &mut M) -> Result<Self, JitError> {
        let call_conv = module.isa().default_call_conv();
        let pointer_type = module.target_config().pointer_type();
        let mut ids = [None; HELPER_COUNT];
        for kind in ALL {
            if helpers.get(kind).is_some() {
                let sig = kind.make_signature(call_conv, pointer_type);
                let func_id = module.declare_function(kind.symbol_name(), Linkage::Import, &sig)?;
                ids[kind as usize] = Some(func_id);
            }
        }
        Ok(Self { ids })
    }
}

/// Per-function helper references for calling helpers from IR.
pub(crate) struct HelperRefs {
    refs: [Option<ir::FuncRef>; HELPER_COUNT],
}

impl HelperRefs {
    /// Declare all available helpers into a function's IR.
    pub fn declare<M: Module>(
        func_ids: &HelperFuncIds,
        module: &mut M,
        func: &mut ir::Function,
    ) -> Self {
        let mut refs = [None; HELPER_COUNT];
        for (i, id) in func_ids.ids.iter().enumerate() {
            if let Some(func_id) = id {
                refs[i] = Some(module.declare_func_in_func(*func_id, func));
            }
        }
        Self { refs }
    }

    /// Get the FuncRef, or return UnsupportedInstruction error.
    pub fn require(
        &self,
        kind: HelperKind,
        pc: usize,
        opcode: qvm_bytecode::Opcode,
    ) -> Result<ir::FuncRef, JitError> {
        self.refs[kind as usize].ok_or(JitError::UnsupportedInstruction { pc, opcode })
    }
}
