//! Image header parsing and validation.
//!
//! All header words are little-endian 32-bit signed integers:
//!
//! ```text
//! magic, instructionCount, codeOffset, codeLength,
//! dataOffset, dataLength, litLength, bssLength[, jtrgLength]
//! ```
//!
//! The trailing `jtrgLength` word exists only in version-2 images.

use serde::Serialize;

use crate::error::{BytecodeError, Result};
use crate::layout;

/// Magic of version-1 images (no jump table).
pub const VM_MAGIC: u32 = 0x1272_1444;

/// Magic of version-2 images (trailing jump-target table).
pub const VM_MAGIC_VER2: u32 = 0x1272_1445;

/// Header size of version-1 images.
pub const HEADER_SIZE_V1: usize = 32;

/// Header size of version-2 images.
pub const HEADER_SIZE_V2: usize = 36;

/// Image format version, selected by the magic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageVersion {
    /// Version 1: indirect jumps are only bounds-checked
    Legacy,
    /// Version 2: indirect jumps are checked against a target table
    JumpTable,
}

impl ImageVersion {
    /// Header size for this version.
    pub fn header_size(self) -> usize {
        match self {
            Self::Legacy => HEADER_SIZE_V1,
            Self::JumpTable => HEADER_SIZE_V2,
        }
    }

    /// Magic word for this version.
    pub fn magic(self) -> u32 {
        match self {
            Self::Legacy => VM_MAGIC,
            Self::JumpTable => VM_MAGIC_VER2,
        }
    }
}

/// Parsed image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    /// Format version
    pub version: ImageVersion,
    /// Number of instructions in the code section
    pub instruction_count: i32,
    /// File offset of the code section
    pub code_offset: i32,
    /// Code section length in bytes
    pub code_length: i32,
    /// File offset of the initialized data section
    pub data_offset: i32,
    /// Initialized data length in bytes (word-swapped on load)
    pub data_length: i32,
    /// Literal data length in bytes (copied verbatim after data)
    pub lit_length: i32,
    /// Zero-initialized data length in bytes (not stored in the file)
    pub bss_length: i32,
    /// Jump-target table length in bytes (version 2 only, else 0)
    pub jtrg_length: i32,
}

fn word(bytes: &[u8], index: usize) -> i32 {
    let at = index * 4;
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn section_end(offset: i32, length: i32) -> usize {
    offset as usize + length as usize
}

impl Header {
    /// Parse and validate the header at the start of `bytes`.
    ///
    /// Validates field signs, the resulting sandbox size and that every
    /// section lies inside `bytes`. Nothing is allocated on failure.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(BytecodeError::Truncated {
                section: "header",
                offset: 0,
                length: 4,
                file_len: bytes.len(),
            });
        }
        let magic = word(bytes, 0) as u32;
        let version = match magic {
            VM_MAGIC => ImageVersion::Legacy,
            VM_MAGIC_VER2 => ImageVersion::JumpTable,
            other => return Err(BytecodeError::UnrecognizedMagic(other)),
        };
        if bytes.len() < version.header_size() {
            return Err(BytecodeError::Truncated {
                section: "header",
                offset: 0,
                length: version.header_size(),
                file_len: bytes.len(),
            });
        }

        let header = Self {
            version,
            instruction_count: word(bytes, 1),
            code_offset: word(bytes, 2),
            code_length: word(bytes, 3),
            data_offset: word(bytes, 4),
            data_length: word(bytes, 5),
            lit_length: word(bytes, 6),
            bss_length: word(bytes, 7),
            jtrg_length: match version {
                ImageVersion::Legacy => 0,
                ImageVersion::JumpTable => word(bytes, 8),
            },
        };
        header.validate(bytes.len())?;
        Ok(header)
    }

    fn validate(&self, file_len: usize) -> Result<()> {
        if self.code_length <= 0 {
            return Err(bad("codeLength", self.code_length));
        }
        for (field, value) in [
            ("instructionCount", self.instruction_count),
            ("codeOffset", self.code_offset),
            ("dataOffset", self.data_offset),
            ("dataLength", self.data_length),
            ("litLength", self.lit_length),
            ("bssLength", self.bss_length),
            ("jtrgLength", self.jtrg_length),
        ] {
            if value < 0 {
                return Err(bad(field, value));
            }
        }
        if self.instruction_count > self.code_length {
            return Err(BytecodeError::InstructionCountExceedsCode {
                count: self.instruction_count,
                code_length: self.code_length,
            });
        }

        let total = self.segment_length();
        if total > layout::MAX_SANDBOX_SIZE {
            return Err(BytecodeError::BadHeader {
                field: "sandbox size",
                value: total as i64,
            });
        }

        check_section("code", self.code_offset, self.code_length, file_len)?;
        check_section(
            "data",
            self.data_offset,
            self.data_length.saturating_add(self.lit_length),
            file_len,
        )?;
        if self.jtrg_length > 0 {
            let offset = section_end(self.data_offset, self.data_length) + self.lit_length as usize;
            if offset + self.jtrg_length as usize > file_len {
                return Err(BytecodeError::Truncated {
                    section: "jump table",
                    offset,
                    length: self.jtrg_length as usize,
                    file_len,
                });
            }
        }
        Ok(())
    }

    /// Bytes of data the module addresses: data + literals + bss.
    pub fn segment_length(&self) -> u64 {
        self.data_length as u64 + self.lit_length as u64 + self.bss_length as u64
    }

    /// Sandbox size this image needs (a power of two).
    pub fn sandbox_size(&self) -> u32 {
        layout::sandbox_size(self.segment_length()) as u32
    }

    /// File offset of the jump-target table.
    pub fn jump_table_offset(&self) -> usize {
        section_end(self.data_offset, self.data_length) + self.lit_length as usize
    }

    /// Number of jump-table entries.
    pub fn jump_target_count(&self) -> usize {
        self.jtrg_length as usize / 4
    }
}

fn bad(field: &'static str, value: i32) -> BytecodeError {
    BytecodeError::BadHeader {
        field,
        value: value as i64,
    }
}

fn check_section(section: &'static str, offset: i32, length: i32, file_len: usize) -> Result<()> {
    if section_end(offset, length) > file_len {
        return Err(BytecodeError::Truncated {
            section,
            offset: offset as usize,
            length: length as usize,
            file_len,
        });
    }
    Ok(())
}
