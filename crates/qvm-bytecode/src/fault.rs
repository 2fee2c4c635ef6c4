//! Runtime faults raised by executing bytecode.
//!
//! Both backends report faults with the same variant and instruction index,
//! so a program misbehaves identically whether interpreted or compiled.
//! Compiled code passes faults across the native boundary as [`Fault::code`].

use serde::Serialize;
use thiserror::Error;

/// A runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[repr(u32)]
pub enum Fault {
    /// `UNDEF` executed
    #[error("undefined instruction")]
    BadOpcode = 1,
    /// `BREAK` executed
    #[error("breakpoint")]
    Breakpoint = 2,
    /// `JUMP` to an address that is not a valid jump target
    #[error("bad jump target")]
    BadJumpTarget = 3,
    /// `CALL` to an address that is not a procedure entry
    #[error("bad call target")]
    BadCallTarget = 4,
    /// `LEAVE` popped an address that is not a return site
    #[error("bad return address")]
    BadReturnAddress = 5,
    /// `ENTER` moved the stack below its bottom
    #[error("program stack overflow")]
    StackOverflow = 6,
    /// Integer division or remainder by zero
    #[error("integer divide by zero")]
    DivideByZero = 7,
    /// `BLOCK_COPY` range leaves the sandbox
    #[error("block copy out of range")]
    BlockCopyOutOfRange = 8,
    /// Call returned with an unbalanced operand stack
    #[error("operand stack corrupted")]
    OpstackCorrupted = 9,
    /// Execution ran past the last instruction
    #[error("fell off the end of the program")]
    FellOffEnd = 10,
}

impl Fault {
    /// Nonzero code used by compiled code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Inverse of [`Fault::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::BadOpcode,
            2 => Self::Breakpoint,
            3 => Self::BadJumpTarget,
            4 => Self::BadCallTarget,
            5 => Self::BadReturnAddress,
            6 => Self::StackOverflow,
            7 => Self::DivideByZero,
            8 => Self::BlockCopyOutOfRange,
            9 => Self::OpstackCorrupted,
            10 => Self::FellOffEnd,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_nonzero_and_reversible() {
        for code in 1..=10 {
            let fault = Fault::from_code(code).unwrap();
            assert_eq!(fault.code(), code);
        }
        assert_eq!(Fault::from_code(0), None);
        assert_eq!(Fault::from_code(11), None);
    }
}
