//! Runtime context shared between compiled code and the host.

use std::ffi::c_void;
use std::mem::offset_of;

/// Fault code set by a runtime helper when the host side failed. The host
/// error itself is kept by whoever owns [`JitContext::host`].
pub const FAULT_HOST: u32 = u32::MAX;

/// State compiled code reads and writes, passed as its only argument.
///
/// The layout is `#[repr(C)]`; generated code addresses fields through the
/// `*_OFFSET` constants below.
#[repr(C)]
#[derive(Debug)]
pub struct JitContext {
    /// Start of the sandbox data segment
    pub data_base: *mut u8,
    /// Operand stack of [`qvm_bytecode::OPSTACK_SIZE`] entries
    pub opstack: *mut i32,
    /// Opaque host state for runtime helpers
    pub host: *mut c_void,
    /// Segment size minus one
    pub data_mask: u32,
    /// Program stack pointer on entry and exit
    pub program_stack: i32,
    /// Fault code (0 = none) when the function returns
    pub fault: u32,
    /// Instruction index of the fault, or of the `LEAVE` that ended a
    /// normal call
    pub fault_pc: i32,
    /// Operand stack index on exit
    pub opstack_top: u32,
}

/// Byte offset of `data_base`.
pub const CTX_DATA_BASE_OFFSET: i32 = offset_of!(JitContext, data_base) as i32;
/// Byte offset of `opstack`.
pub const CTX_OPSTACK_OFFSET: i32 = offset_of!(JitContext, opstack) as i32;
/// Byte offset of `program_stack`.
pub const CTX_PROGRAM_STACK_OFFSET: i32 = offset_of!(JitContext, program_stack) as i32;
/// Byte offset of `fault`.
pub const CTX_FAULT_OFFSET: i32 = offset_of!(JitContext, fault) as i32;
/// Byte offset of `fault_pc`.
pub const CTX_FAULT_PC_OFFSET: i32 = offset_of!(JitContext, fault_pc) as i32;
/// Byte offset of `opstack_top`.
pub const CTX_OPSTACK_TOP_OFFSET: i32 = offset_of!(JitContext, opstack_top) as i32;

impl JitContext {
    /// Context for a call starting at `program_stack` with an empty operand stack.
    pub fn new(
        data_base: *mut u8,
        data_mask: u32,
        opstack: *mut i32,
        host: *mut c_void,
        program_stack: i32,
    ) -> Self {
        Self {
            data_base,
            opstack,
            host,
            data_mask,
            program_stack,
            fault: 0,
            fault_pc: 0,
            opstack_top: 0,
        }
    }
}
