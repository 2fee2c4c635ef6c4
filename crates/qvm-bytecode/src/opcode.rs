//! The stack-machine instruction set.
//!
//! Opcode numbering is part of the image format and must not change.

use std::fmt;

/// One bytecode opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Undefined instruction; faults when executed
    Undef = 0,
    /// No operation
    Ignore,
    /// Debug breakpoint; faults when executed
    Break,
    /// Procedure entry: allocate `n` bytes of frame
    Enter,
    /// Procedure exit: release `n` bytes and return
    Leave,
    /// Call the procedure (or syscall) on top of the stack
    Call,
    /// Push a zero
    Push,
    /// Discard the top value
    Pop,
    /// Push an immediate
    Const,
    /// Push the address of a frame-relative local
    Local,
    /// Jump to the address on top of the stack
    Jump,
    /// Branch if equal
    Eq,
    /// Branch if not equal
    Ne,
    /// Branch if signed less than
    Lti,
    /// Branch if signed less or equal
    Lei,
    /// Branch if signed greater than
    Gti,
    /// Branch if signed greater or equal
    Gei,
    /// Branch if unsigned less than
    Ltu,
    /// Branch if unsigned less or equal
    Leu,
    /// Branch if unsigned greater than
    Gtu,
    /// Branch if unsigned greater or equal
    Geu,
    /// Branch if float equal
    Eqf,
    /// Branch if float not equal (true for NaN)
    Nef,
    /// Branch if float less than
    Ltf,
    /// Branch if float less or equal
    Lef,
    /// Branch if float greater than
    Gtf,
    /// Branch if float greater or equal
    Gef,
    /// Load a zero-extended byte
    Load1,
    /// Load a zero-extended halfword
    Load2,
    /// Load a word
    Load4,
    /// Store a byte
    Store1,
    /// Store a halfword
    Store2,
    /// Store a word
    Store4,
    /// Store an outgoing call argument at frame offset `n`
    Arg,
    /// Copy `n` bytes between two sandbox addresses
    BlockCopy,
    /// Sign-extend the low byte
    Sex8,
    /// Sign-extend the low halfword
    Sex16,
    /// Integer negate
    Negi,
    /// Integer add
    Add,
    /// Integer subtract
    Sub,
    /// Signed divide
    Divi,
    /// Unsigned divide
    Divu,
    /// Signed remainder
    Modi,
    /// Unsigned remainder
    Modu,
    /// Signed multiply
    Muli,
    /// Unsigned multiply
    Mulu,
    /// Bitwise and
    Band,
    /// Bitwise or
    Bor,
    /// Bitwise xor
    Bxor,
    /// Bitwise complement
    Bcom,
    /// Shift left
    Lsh,
    /// Arithmetic shift right
    Rshi,
    /// Logical shift right
    Rshu,
    /// Float negate
    Negf,
    /// Float add
    Addf,
    /// Float subtract
    Subf,
    /// Float divide
    Divf,
    /// Float multiply
    Mulf,
    /// Convert integer to float
    Cvif,
    /// Convert float to integer (saturating)
    Cvfi,
}

/// Number of defined opcodes.
pub const OPCODE_COUNT: usize = 60;

const ALL: [Opcode; OPCODE_COUNT] = {
    use Opcode::*;
    [
        Undef, Ignore, Break, Enter, Leave, Call, Push, Pop, Const, Local, Jump, Eq, Ne, Lti, Lei,
        Gti, Gei, Ltu, Leu, Gtu, Geu, Eqf, Nef, Ltf, Lef, Gtf, Gef, Load1, Load2, Load4, Store1,
        Store2, Store4, Arg, BlockCopy, Sex8, Sex16, Negi, Add, Sub, Divi, Divu, Modi, Modu, Muli,
        Mulu, Band, Bor, Bxor, Bcom, Lsh, Rshi, Rshu, Negf, Addf, Subf, Divf, Mulf, Cvif, Cvfi,
    ]
};

impl Opcode {
    /// Decode an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        ALL.get(byte as usize).copied()
    }

    /// Width in bytes of the immediate operand following the opcode byte.
    pub fn operand_size(self) -> usize {
        match self {
            Self::Enter
            | Self::Leave
            | Self::Const
            | Self::Local
            | Self::BlockCopy
            | Self::Eq
            | Self::Ne
            | Self::Lti
            | Self::Lei
            | Self::Gti
            | Self::Gei
            | Self::Ltu
            | Self::Leu
            | Self::Gtu
            | Self::Geu
            | Self::Eqf
            | Self::Nef
            | Self::Ltf
            | Self::Lef
            | Self::Gtf
            | Self::Gef => 4,
            Self::Arg => 1,
            _ => 0,
        }
    }

    /// Whether this is a conditional branch whose operand is an instruction index.
    pub fn is_branch(self) -> bool {
        (Self::Eq as u8..=Self::Gef as u8).contains(&(self as u8))
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Leave | Self::Jump)
    }

    /// Assembler mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Undef => "UNDEF",
            Self::Ignore => "IGNORE",
            Self::Break => "BREAK",
            Self::Enter => "ENTER",
            Self::Leave => "LEAVE",
            Self::Call => "CALL",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Const => "CONST",
            Self::Local => "LOCAL",
            Self::Jump => "JUMP",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lti => "LTI",
            Self::Lei => "LEI",
            Self::Gti => "GTI",
            Self::Gei => "GEI",
            Self::Ltu => "LTU",
            Self::Leu => "LEU",
            Self::Gtu => "GTU",
            Self::Geu => "GEU",
            Self::Eqf => "EQF",
            Self::Nef => "NEF",
            Self::Ltf => "LTF",
            Self::Lef => "LEF",
            Self::Gtf => "GTF",
            Self::Gef => "GEF",
            Self::Load1 => "LOAD1",
            Self::Load2 => "LOAD2",
            Self::Load4 => "LOAD4",
            Self::Store1 => "STORE1",
            Self::Store2 => "STORE2",
            Self::Store4 => "STORE4",
            Self::Arg => "ARG",
            Self::BlockCopy => "BLOCK_COPY",
            Self::Sex8 => "SEX8",
            Self::Sex16 => "SEX16",
            Self::Negi => "NEGI",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Divi => "DIVI",
            Self::Divu => "DIVU",
            Self::Modi => "MODI",
            Self::Modu => "MODU",
            Self::Muli => "MULI",
            Self::Mulu => "MULU",
            Self::Band => "BAND",
            Self::Bor => "BOR",
            Self::Bxor => "BXOR",
            Self::Bcom => "BCOM",
            Self::Lsh => "LSH",
            Self::Rshi => "RSHI",
            Self::Rshu => "RSHU",
            Self::Negf => "NEGF",
            Self::Addf => "ADDF",
            Self::Subf => "SUBF",
            Self::Divf => "DIVF",
            Self::Mulf => "MULF",
            Self::Cvif => "CVIF",
            Self::Cvfi => "CVFI",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
