//! Fully validated module images.

use crate::error::Result;
use crate::header::{Header, ImageVersion};
use crate::program::Program;

/// A parsed image: header, decoded program and the initialized data bytes.
///
/// Parsing performs every validation up front, so a sandbox is only ever
/// allocated for an image that is known to load.
#[derive(Debug, Clone)]
pub struct Image {
    /// Parsed header
    pub header: Header,
    /// Decoded code section
    pub program: Program,
    data: Vec<u8>,
}

impl Image {
    /// Parse and validate a complete image file.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = Header::parse(bytes)?;

        let code_start = header.code_offset as usize;
        let code = &bytes[code_start..code_start + header.code_length as usize];

        let data_start = header.data_offset as usize;
        let data_len = header.data_length as usize + header.lit_length as usize;
        let data = bytes[data_start..data_start + data_len].to_vec();

        let jump_table = match header.version {
            ImageVersion::Legacy => Vec::new(),
            ImageVersion::JumpTable => {
                let start = header.jump_table_offset();
                bytes[start..start + header.jump_target_count() * 4]
                    .chunks_exact(4)
                    .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect()
            }
        };

        let program = Program::decode(
            code,
            header.instruction_count as usize,
            header.version,
            jump_table,
        )?;

        Ok(Self {
            header,
            program,
            data,
        })
    }

    /// Copy initialized data and literals into the start of `segment`.
    ///
    /// Initialized data is converted word by word from little-endian to host
    /// order; literal bytes are copied unchanged.
    pub fn write_initial_data(&self, segment: &mut [u8]) {
        let data_len = self.header.data_length as usize;
        let (data, literals) = self.data.split_at(data_len);

        let words = data.chunks_exact(4);
        let tail = words.remainder();
        let mut at = 0;
        for word in words {
            let value = i32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            segment[at..at + 4].copy_from_slice(&value.to_ne_bytes());
            at += 4;
        }
        segment[at..at + tail.len()].copy_from_slice(tail);

        segment[data_len..data_len + literals.len()].copy_from_slice(literals);
    }
}
