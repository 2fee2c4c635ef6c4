//! Compiled backend: runtime helpers for Cranelift-generated code and the
//! invocation path.
//!
//! Generated code calls back into the host for syscalls, block copies and
//! profiling through the `extern "C"` helpers below. They find the registry
//! through the [`CompiledFrame`] that `JitContext::host` points at.
//!
//! # Safety
//!
//! The context and frame are built by [`run`] on its own stack and live
//! for the whole invocation. Helpers never unwind into generated code: host
//! errors and panics are parked in the frame and reported through
//! [`FAULT_HOST`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use qvm_bytecode::layout::block_copy_in_range;
use qvm_bytecode::{Fault, OPSTACK_SIZE, Program};
use qvm_jit::{
    CompiledProgram, FAULT_HOST, HelperKind, JitCompiler, JitContext, JitError, RuntimeHelpers,
    TranslateOptions,
};
use qvm_profiler::CallProfile;

use crate::error::{VmError, VmResult};
use crate::instance::VmHandle;
use crate::interpreter::Trap;
use crate::registry::ModuleRegistry;

/// Turns a decoded program into native code.
///
/// The registry uses [`CraneliftTranslator`] unless another translator is
/// installed with [`ModuleRegistry::with_translator`].
pub trait Translator {
    /// Translate `program`. A failure makes the module fall back to the
    /// interpreter.
    fn translate(
        &self,
        name: &str,
        program: &Program,
        options: &TranslateOptions,
    ) -> Result<CompiledProgram, JitError>;
}

/// Whole-program Cranelift translation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CraneliftTranslator;

impl Translator for CraneliftTranslator {
    fn translate(
        &self,
        name: &str,
        program: &Program,
        options: &TranslateOptions,
    ) -> Result<CompiledProgram, JitError> {
        JitCompiler::new(&build_runtime_helpers())?.compile(name, program, options)
    }
}

/// Helper table wired to this crate's runtime helpers.
pub fn build_runtime_helpers() -> RuntimeHelpers {
    let mut helpers = RuntimeHelpers::new();
    // SAFETY: Function signatures match HelperKind conventions.
    unsafe {
        helpers.set(HelperKind::Syscall, qvm_rt_syscall as *const u8);
        helpers.set(HelperKind::BlockCopy, qvm_rt_block_copy as *const u8);
        helpers.set(HelperKind::Profile, qvm_rt_profile as *const u8);
    }
    helpers
}

/// Host state behind `JitContext::host` for one invocation.
struct CompiledFrame {
    registry: *mut ModuleRegistry,
    caller: VmHandle,
    profile: Option<Arc<CallProfile>>,
    error: Option<VmError>,
}

/// Where a compiled call starts.
pub(crate) struct CompiledEntry {
    pub data_base: *mut u8,
    pub data_mask: u32,
    pub ps: i32,
    pub profile: Option<Arc<CallProfile>>,
}

/// Run compiled code for one host call.
///
/// The outer error is a host failure raised inside a syscall; the inner one
/// is a bytecode fault.
pub(crate) fn run(
    registry: &mut ModuleRegistry,
    caller: VmHandle,
    code: &CompiledProgram,
    entry: CompiledEntry,
) -> VmResult<Result<i32, Trap>> {
    let mut opstack = [0i32; OPSTACK_SIZE];
    let mut frame = CompiledFrame {
        registry: registry as *mut ModuleRegistry,
        caller,
        profile: entry.profile,
        error: None,
    };
    let mut ctx = JitContext::new(
        entry.data_base,
        entry.data_mask,
        opstack.as_mut_ptr(),
        (&mut frame as *mut CompiledFrame).cast(),
        entry.ps,
    );

    // SAFETY: `data_base` addresses the caller's live segment (kept alive by
    // the registry until the outermost call returns), the opstack and frame
    // outlive the call, and the helpers match `build_runtime_helpers`.
    let value = unsafe { code.invoke(&mut ctx) };

    match ctx.fault {
        0 if ctx.opstack_top == 1 => Ok(Ok(value)),
        0 => Ok(Err(Trap {
            fault: Fault::OpstackCorrupted,
            pc: ctx.fault_pc,
        })),
        FAULT_HOST => Err(frame
            .error
            .take()
            .unwrap_or_else(|| VmError::Host("syscall failed without an error".to_string()))),
        code => Ok(Err(Trap {
            fault: Fault::from_code(code).unwrap_or(Fault::BadOpcode),
            pc: ctx.fault_pc,
        })),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("syscall handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("syscall handler panicked: {message}")
    } else {
        "syscall handler panicked".to_string()
    }
}

/// Runtime helper: Syscall.
///
/// Signature: `(ctx, ps) -> result`
#[allow(unsafe_code)]
extern "C" fn qvm_rt_syscall(ctx: *mut JitContext, ps: i32) -> i32 {
    // SAFETY: `ctx` is the context built by `run`; its host is a CompiledFrame.
    let ctx = unsafe { &mut *ctx };
    let frame = unsafe { &mut *ctx.host.cast::<CompiledFrame>() };
    let (registry, caller) = (frame.registry, frame.caller);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the registry is parked in `run` for the duration of the
        // compiled call and nothing else touches it meanwhile.
        let registry = unsafe { &mut *registry };
        registry.bytecode_syscall(caller, ps)
    }));
    let error = match outcome {
        Ok(Ok(value)) => return value,
        Ok(Err(error)) => error,
        Err(payload) => VmError::Host(panic_message(payload)),
    };
    frame.error = Some(error);
    ctx.fault = FAULT_HOST;
    0
}

/// Runtime helper: BlockCopy.
///
/// Signature: `(ctx, dest, src, len) -> fault code or 0`
#[allow(unsafe_code)]
extern "C" fn qvm_rt_block_copy(ctx: *mut JitContext, dest: i32, src: i32, len: i32) -> i32 {
    let ctx = unsafe { &*ctx };
    if !block_copy_in_range(dest, src, len as u32, ctx.data_mask) {
        return Fault::BlockCopyOutOfRange.code() as i32;
    }
    // SAFETY: both ranges were checked to lie inside the segment.
    unsafe {
        std::ptr::copy(
            ctx.data_base.add(src as u32 as usize),
            ctx.data_base.add(dest as u32 as usize),
            len as u32 as usize,
        );
    }
    0
}

/// Runtime helper: Profile.
///
/// Signature: `(ctx, pc) -> 0`
#[allow(unsafe_code)]
extern "C" fn qvm_rt_profile(ctx: *mut JitContext, pc: i32) -> i32 {
    let ctx = unsafe { &*ctx };
    let frame = unsafe { &*ctx.host.cast::<CompiledFrame>() };
    if let Some(profile) = &frame.profile {
        profile.record(pc as usize);
    }
    0
}
