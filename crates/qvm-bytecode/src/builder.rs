//! Minimal image assembler.
//!
//! Produces well-formed images from hand-written instruction lists. It does
//! no label resolution; branch and jump operands are instruction indices.

use crate::header::{ImageVersion, VM_MAGIC, VM_MAGIC_VER2};
use crate::opcode::Opcode;

/// Builder for module images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    version: ImageVersion,
    code: Vec<(Opcode, i32)>,
    data: Vec<i32>,
    literals: Vec<u8>,
    bss: u32,
    jump_targets: Vec<i32>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// Start a version-2 image.
    pub fn new() -> Self {
        Self {
            version: ImageVersion::JumpTable,
            code: Vec::new(),
            data: Vec::new(),
            literals: Vec::new(),
            bss: 0,
            jump_targets: Vec::new(),
        }
    }

    /// Emit a version-1 image (no jump table) instead.
    pub fn legacy(mut self) -> Self {
        self.version = ImageVersion::Legacy;
        self
    }

    /// Append an instruction. The operand is ignored for opcodes without one.
    pub fn op(mut self, opcode: Opcode, operand: i32) -> Self {
        self.code.push((opcode, operand));
        self
    }

    /// Append several instructions.
    pub fn ops(mut self, ops: impl IntoIterator<Item = (Opcode, i32)>) -> Self {
        self.code.extend(ops);
        self
    }

    /// Index the next appended instruction will have.
    pub fn here(&self) -> i32 {
        self.code.len() as i32
    }

    /// Append a word of initialized data.
    pub fn data_word(mut self, value: i32) -> Self {
        self.data.push(value);
        self
    }

    /// Append literal bytes.
    pub fn literal(mut self, bytes: &[u8]) -> Self {
        self.literals.extend_from_slice(bytes);
        self
    }

    /// Reserve zero-initialized bytes.
    pub fn bss(mut self, length: u32) -> Self {
        self.bss = length;
        self
    }

    /// Register an indirect jump destination (version 2 only).
    pub fn jump_target(mut self, target: i32) -> Self {
        self.jump_targets.push(target);
        self
    }

    /// Serialize the image.
    pub fn build(&self) -> Vec<u8> {
        let mut code = Vec::new();
        for &(opcode, operand) in &self.code {
            code.push(opcode as u8);
            match opcode.operand_size() {
                4 => code.extend_from_slice(&operand.to_le_bytes()),
                1 => code.push(operand as u8),
                _ => {}
            }
        }
        code.resize(code.len().next_multiple_of(4), 0);

        let header_size = self.version.header_size();
        let code_offset = header_size;
        let data_offset = code_offset + code.len();
        let data_length = self.data.len() * 4;

        let (magic, jtrg_length) = match self.version {
            ImageVersion::Legacy => (VM_MAGIC, None),
            ImageVersion::JumpTable => (VM_MAGIC_VER2, Some(self.jump_targets.len() * 4)),
        };

        let mut words = vec![
            magic as i32,
            self.code.len() as i32,
            code_offset as i32,
            code.len() as i32,
            data_offset as i32,
            data_length as i32,
            self.literals.len() as i32,
            self.bss as i32,
        ];
        words.extend(jtrg_length.map(|len| len as i32));

        let mut out: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        out.extend_from_slice(&code);
        out.extend(self.data.iter().flat_map(|w| w.to_le_bytes()));
        out.extend_from_slice(&self.literals);
        if jtrg_length.is_some() {
            out.extend(self.jump_targets.iter().flat_map(|w| w.to_le_bytes()));
        }
        out
    }
}
