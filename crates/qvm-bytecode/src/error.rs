//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while parsing or validating a module image
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// The first header word is neither known magic value
    #[error("unrecognized magic 0x{0:08x}")]
    UnrecognizedMagic(u32),

    /// A header field holds an impossible value
    #[error("bad header: {field} = {value}")]
    BadHeader {
        /// Header field name
        field: &'static str,
        /// Value read from the file
        value: i64,
    },

    /// More instructions than code bytes; every instruction takes at least one
    #[error("instructionCount {count} exceeds codeLength {code_length}")]
    InstructionCountExceedsCode {
        /// Declared instruction count
        count: i32,
        /// Declared code section length
        code_length: i32,
    },

    /// A section or the header itself extends past the end of the file
    #[error("{section} section [{offset}, +{length}) exceeds file length {file_len}")]
    Truncated {
        /// Section name
        section: &'static str,
        /// Section start in the file
        offset: usize,
        /// Section length in bytes
        length: usize,
        /// Total file length
        file_len: usize,
    },

    /// An opcode byte outside the instruction set
    #[error("invalid opcode {byte} at instruction {pc}")]
    InvalidOpcode {
        /// Instruction index
        pc: usize,
        /// Raw opcode byte
        byte: u8,
    },

    /// A conditional branch operand points outside the program
    #[error("branch at instruction {pc} targets {target} (count {count})")]
    BranchOutOfRange {
        /// Instruction index of the branch
        pc: usize,
        /// Branch operand
        target: i32,
        /// Instruction count
        count: usize,
    },

    /// A jump-table entry points outside the program
    #[error("jump table entry {index} targets {target} (count {count})")]
    JumpTableTarget {
        /// Position in the jump table
        index: usize,
        /// Entry value
        target: i32,
        /// Instruction count
        count: usize,
    },

    /// Instruction 0 does not set up a frame
    #[error("instruction 0 must be ENTER")]
    MissingEntryFrame,
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
