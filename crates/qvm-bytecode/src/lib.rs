//! # QVM Bytecode
//!
//! This crate defines the on-disk module image format for sandboxed game
//! logic ("progs") and the decoded form both execution backends consume.
//!
//! ## Layout
//!
//! - [`header`]: the little-endian image header and its validation
//! - [`opcode`]: the stack-machine instruction set
//! - [`program`]: decoded instruction stream with precomputed target sets
//! - [`image`]: a fully validated image ready to be placed in a sandbox
//! - [`layout`]: sandbox sizing and memory-access rules shared by backends
//! - [`fault`]: runtime fault taxonomy shared by the interpreter and the JIT
//! - [`builder`]: a small assembler producing images for tests and demos

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod builder;
pub mod error;
pub mod fault;
pub mod header;
pub mod image;
pub mod layout;
pub mod opcode;
pub mod program;

pub use builder::ImageBuilder;
pub use error::BytecodeError;
pub use fault::Fault;
pub use header::{Header, ImageVersion, VM_MAGIC, VM_MAGIC_VER2};
pub use image::Image;
pub use opcode::Opcode;
pub use program::{Instruction, Program};

/// Operand stack depth. The stack index wraps modulo this value.
pub const OPSTACK_SIZE: usize = 256;

/// Maximum number of integer arguments a host call passes to a module.
pub const MAX_CALL_ARGS: usize = 10;

/// Number of word slots handed to the host on every syscall (slot 0 is the
/// syscall number).
pub const MAX_SYSCALL_ARGS: usize = 16;
