//! # QVM JIT
//!
//! Whole-program Cranelift translation of QVM bytecode.
//!
//! A program becomes one native function `extern "C" fn(*mut JitContext) -> i32`
//! with one basic block per instruction. Indirect control flow (calls,
//! returns, jumps) goes through shared dispatch blocks that only accept the
//! targets the interpreter accepts, and every fault leaves through a single
//! block that records the fault code and instruction index in the context.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod compiler;
pub mod context;
pub mod runtime_helpers;
pub mod translator;

pub use compiler::{CompiledProgram, JitCompiler, JitError, TranslateOptions};
pub use context::{FAULT_HOST, JitContext};
pub use runtime_helpers::{HelperKind, RuntimeHelpers};
