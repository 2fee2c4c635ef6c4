//! Decoded instruction stream.
//!
//! Decoding validates everything that can be checked statically so the
//! backends only need cheap set lookups at run time: conditional branch
//! operands are in range, jump-table entries are in range and instruction 0
//! opens a frame.

use std::fmt;

use crate::error::{BytecodeError, Result};
use crate::header::ImageVersion;
use crate::opcode::Opcode;

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Opcode
    pub opcode: Opcode,
    /// Immediate operand (0 when the opcode has none)
    pub operand: i32,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.opcode.operand_size() == 0 {
            write!(f, "{}", self.opcode)
        } else {
            write!(f, "{} {}", self.opcode, self.operand)
        }
    }
}

/// Dense set of instruction indices.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    bits: Vec<u64>,
    len: usize,
}

impl TargetSet {
    fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn insert(&mut self, index: usize) {
        self.bits[index / 64] |= 1 << (index % 64);
    }

    /// Whether `target` is a member. Negative values never are.
    #[inline]
    pub fn contains(&self, target: i32) -> bool {
        let Ok(index) = usize::try_from(target) else {
            return false;
        };
        index < self.len && self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&index| self.bits[index / 64] & (1 << (index % 64)) != 0)
    }
}

/// A decoded, validated program.
#[derive(Debug, Clone)]
pub struct Program {
    version: ImageVersion,
    instructions: Vec<Instruction>,
    offsets: Vec<u32>,
    jump_table: Vec<i32>,
    jump_targets: Option<TargetSet>,
    entries: TargetSet,
    return_sites: TargetSet,
}

impl Program {
    /// Decode `count` instructions from `code`.
    ///
    /// `jump_table` is the image's jump-target list; it is only consulted for
    /// [`ImageVersion::JumpTable`] images.
    pub fn decode(
        code: &[u8],
        count: usize,
        version: ImageVersion,
        jump_table: Vec<i32>,
    ) -> Result<Self> {
        let capacity = count.min(code.len());
        let mut instructions = Vec::with_capacity(capacity);
        let mut offsets = Vec::with_capacity(capacity);
        let mut at = 0usize;

        for pc in 0..count {
            let Some(&byte) = code.get(at) else {
                return Err(truncated_code(at, 1, code.len()));
            };
            let opcode =
                Opcode::from_byte(byte).ok_or(BytecodeError::InvalidOpcode { pc, byte })?;
            let width = opcode.operand_size();
            let Some(raw) = code.get(at + 1..at + 1 + width) else {
                return Err(truncated_code(at, 1 + width, code.len()));
            };
            let operand = match width {
                4 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                1 => raw[0] as i32,
                _ => 0,
            };
            offsets.push(at as u32);
            instructions.push(Instruction { opcode, operand });
            at += 1 + width;
        }

        if instructions.first().map(|i| i.opcode) != Some(Opcode::Enter) {
            return Err(BytecodeError::MissingEntryFrame);
        }

        let mut entries = TargetSet::new(count);
        let mut return_sites = TargetSet::new(count);
        for (pc, instruction) in instructions.iter().enumerate() {
            match instruction.opcode {
                Opcode::Enter => entries.insert(pc),
                Opcode::Call if pc + 1 < count => return_sites.insert(pc + 1),
                op if op.is_branch() => {
                    if !(0..count as i64).contains(&(instruction.operand as i64)) {
                        return Err(BytecodeError::BranchOutOfRange {
                            pc,
                            target: instruction.operand,
                            count,
                        });
                    }
                }
                _ => {}
            }
        }

        let (jump_table, jump_targets) = match version {
            ImageVersion::Legacy => (Vec::new(), None),
            ImageVersion::JumpTable => {
                let mut set = TargetSet::new(count);
                for (index, &target) in jump_table.iter().enumerate() {
                    if !(0..count as i64).contains(&(target as i64)) {
                        return Err(BytecodeError::JumpTableTarget {
                            index,
                            target,
                            count,
                        });
                    }
                    set.insert(target as usize);
                }
                for pair in instructions.windows(2) {
                    if pair[0].opcode == Opcode::Const
                        && pair[1].opcode == Opcode::Jump
                        && (0..count as i64).contains(&(pair[0].operand as i64))
                    {
                        set.insert(pair[0].operand as usize);
                    }
                }
                (jump_table, Some(set))
            }
        };

        Ok(Self {
            version,
            instructions,
            offsets,
            jump_table,
            jump_targets,
            entries,
            return_sites,
        })
    }

    /// Image version the program came from.
    pub fn version(&self) -> ImageVersion {
        self.version
    }

    /// Decoded instructions.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the program is empty (never true for a decoded program).
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Byte offset of instruction `pc` inside the code section.
    pub fn offset_of(&self, pc: usize) -> Option<u32> {
        self.offsets.get(pc).copied()
    }

    /// Jump-target list as stored in the image.
    pub fn jump_table(&self) -> &[i32] {
        &self.jump_table
    }

    /// Whether indirect jumps are checked against a target set.
    pub fn verifies_jumps(&self) -> bool {
        self.jump_targets.is_some()
    }

    /// Whether `target` is a legal `JUMP` destination.
    ///
    /// Legacy images carry no target table, so any in-range index is legal.
    #[inline]
    pub fn is_jump_target(&self, target: i32) -> bool {
        match &self.jump_targets {
            Some(set) => set.contains(target),
            None => (0..self.instructions.len() as i64).contains(&(target as i64)),
        }
    }

    /// Whether `target` is a procedure entry (an `ENTER` instruction).
    #[inline]
    pub fn is_procedure_entry(&self, target: i32) -> bool {
        self.entries.contains(target)
    }

    /// Whether `target` immediately follows a `CALL`.
    #[inline]
    pub fn is_return_site(&self, target: i32) -> bool {
        self.return_sites.contains(target)
    }

    /// Legal `JUMP` destinations in ascending order.
    pub fn jump_targets(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match &self.jump_targets {
            Some(set) => Box::new(set.iter()),
            None => Box::new(0..self.instructions.len()),
        }
    }

    /// Procedure entries in ascending order.
    pub fn procedure_entries(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter()
    }

    /// Return sites in ascending order.
    pub fn return_sites(&self) -> impl Iterator<Item = usize> + '_ {
        self.return_sites.iter()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, instruction) in self.instructions.iter().enumerate() {
            let marker = if self.entries.contains(pc as i32) {
                '>'
            } else {
                ' '
            };
            writeln!(
                f,
                "{marker}{pc:7}  {:08x}  {instruction}",
                self.offsets[pc]
            )?;
        }
        Ok(())
    }
}

fn truncated_code(offset: usize, length: usize, file_len: usize) -> BytecodeError {
    BytecodeError::Truncated {
        section: "code",
        offset,
        length,
        file_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(ops: &[(Opcode, i32)]) -> Vec<u8> {
        let mut code = Vec::new();
        for &(op, operand) in ops {
            code.push(op as u8);
            match op.operand_size() {
                4 => code.extend_from_slice(&operand.to_le_bytes()),
                1 => code.push(operand as u8),
                _ => {}
            }
        }
        code
    }

    #[test]
    fn decodes_operands_and_offsets() {
        let code = encode(&[
            (Opcode::Enter, 8),
            (Opcode::Arg, 12),
            (Opcode::Const, -7),
            (Opcode::Leave, 8),
        ]);
        let program = Program::decode(&code, 4, ImageVersion::Legacy, Vec::new()).unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(program.instructions()[1].operand, 12);
        assert_eq!(program.instructions()[2].operand, -7);
        assert_eq!(program.offset_of(0), Some(0));
        assert_eq!(program.offset_of(1), Some(5));
        assert_eq!(program.offset_of(2), Some(7));
        assert_eq!(program.offset_of(3), Some(12));
    }

    #[test]
    fn oversized_count_is_truncation_not_allocation() {
        let code = encode(&[(Opcode::Enter, 8), (Opcode::Leave, 8)]);
        assert!(matches!(
            Program::decode(&code, usize::MAX, ImageVersion::Legacy, Vec::new()),
            Err(BytecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn requires_entry_frame() {
        let code = encode(&[(Opcode::Const, 1), (Opcode::Leave, 0)]);
        assert!(matches!(
            Program::decode(&code, 2, ImageVersion::Legacy, Vec::new()),
            Err(BytecodeError::MissingEntryFrame)
        ));
    }

    #[test]
    fn rejects_invalid_opcode() {
        let mut code = encode(&[(Opcode::Enter, 0)]);
        code.push(200);
        assert!(matches!(
            Program::decode(&code, 2, ImageVersion::Legacy, Vec::new()),
            Err(BytecodeError::InvalidOpcode { pc: 1, byte: 200 })
        ));
    }

    #[test]
    fn rejects_truncated_operand() {
        let mut code = encode(&[(Opcode::Enter, 0)]);
        code.extend_from_slice(&[Opcode::Const as u8, 1, 0]);
        assert!(matches!(
            Program::decode(&code, 2, ImageVersion::Legacy, Vec::new()),
            Err(BytecodeError::Truncated { section: "code", .. })
        ));
    }

    #[test]
    fn rejects_branch_out_of_range() {
        let code = encode(&[
            (Opcode::Enter, 0),
            (Opcode::Const, 0),
            (Opcode::Const, 0),
            (Opcode::Eq, 9),
        ]);
        assert!(matches!(
            Program::decode(&code, 4, ImageVersion::Legacy, Vec::new()),
            Err(BytecodeError::BranchOutOfRange { pc: 3, target: 9, .. })
        ));
    }

    #[test]
    fn jump_targets_include_table_and_const_jump_pairs() {
        let code = encode(&[
            (Opcode::Enter, 0),
            (Opcode::Const, 4),
            (Opcode::Jump, 0),
            (Opcode::Ignore, 0),
            (Opcode::Ignore, 0),
            (Opcode::Ignore, 0),
        ]);
        let program = Program::decode(&code, 6, ImageVersion::JumpTable, vec![5]).unwrap();
        assert!(program.verifies_jumps());
        assert!(program.is_jump_target(4));
        assert!(program.is_jump_target(5));
        assert!(!program.is_jump_target(3));
        assert!(!program.is_jump_target(-1));
        assert_eq!(program.jump_targets().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn legacy_jumps_are_only_bounds_checked() {
        let code = encode(&[(Opcode::Enter, 0), (Opcode::Ignore, 0), (Opcode::Leave, 0)]);
        let program = Program::decode(&code, 3, ImageVersion::Legacy, vec![]).unwrap();
        assert!(program.is_jump_target(1));
        assert!(program.is_jump_target(2));
        assert!(!program.is_jump_target(3));
        assert!(!program.is_jump_target(-2));
    }

    #[test]
    fn rejects_bad_jump_table_entry() {
        let code = encode(&[(Opcode::Enter, 0), (Opcode::Leave, 0)]);
        assert!(matches!(
            Program::decode(&code, 2, ImageVersion::JumpTable, vec![1, 7]),
            Err(BytecodeError::JumpTableTarget { index: 1, target: 7, .. })
        ));
    }

    #[test]
    fn call_sites_and_entries() {
        let code = encode(&[
            (Opcode::Enter, 8),
            (Opcode::Const, 3),
            (Opcode::Call, 0),
            (Opcode::Enter, 0),
            (Opcode::Leave, 0),
        ]);
        let program = Program::decode(&code, 5, ImageVersion::Legacy, vec![]).unwrap();
        assert!(program.is_procedure_entry(0));
        assert!(program.is_procedure_entry(3));
        assert!(!program.is_procedure_entry(1));
        assert!(program.is_return_site(3));
        assert!(!program.is_return_site(2));
    }
}
