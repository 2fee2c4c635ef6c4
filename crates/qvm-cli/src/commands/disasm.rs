//! Disasm command - list the instructions of an image file.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use qvm_bytecode::{Image, Opcode};
use qvm_core::SymbolTable;

#[derive(Args)]
pub struct DisasmCommand {
    /// Image file
    pub file: PathBuf,

    /// Symbol map; defaults to the image path with a `.map` extension
    #[arg(long)]
    pub map: Option<PathBuf>,
}

impl DisasmCommand {
    pub fn run(&self) -> Result<()> {
        let bytes = std::fs::read(&self.file)
            .with_context(|| format!("failed to read {}", self.file.display()))?;
        let image = Image::parse(&bytes)
            .with_context(|| format!("invalid image {}", self.file.display()))?;

        let map_path = self
            .map
            .clone()
            .unwrap_or_else(|| self.file.with_extension("map"));
        let symbols = std::fs::read_to_string(&map_path)
            .ok()
            .map(|text| SymbolTable::parse(&text));

        print!("{}", disassemble(&image, symbols.as_ref()));
        Ok(())
    }
}

/// Text listing of `image`, with procedure labels from `symbols`.
pub fn disassemble(image: &Image, symbols: Option<&SymbolTable>) -> String {
    let header = &image.header;
    let program = &image.program;
    let mut out = String::new();
    let _ = writeln!(out, "; version {:?}", header.version);
    let _ = writeln!(
        out,
        "; {} instructions, code {} bytes, data {} bytes, lit {} bytes, bss {} bytes",
        header.instruction_count,
        header.code_length,
        header.data_length,
        header.lit_length,
        header.bss_length
    );
    let _ = writeln!(out, "; sandbox {} bytes", header.sandbox_size());

    for (pc, instruction) in program.instructions().iter().enumerate() {
        if instruction.opcode == Opcode::Enter {
            let label = symbols
                .and_then(|table| table.exact(pc as u32))
                .map_or_else(|| format!("proc_{pc}"), str::to_string);
            let _ = writeln!(out, "\n{label}:");
        }
        let offset = program.offset_of(pc).unwrap_or(0);
        let marker = if program.is_jump_target(pc as i32) { '>' } else { ' ' };
        let _ = writeln!(out, "{marker}{pc:6} {offset:08x}  {instruction}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvm_bytecode::ImageBuilder;

    #[test]
    fn test_listing_labels_procedures() {
        let bytes = ImageBuilder::new()
            .ops([
                (Opcode::Enter, 8),
                (Opcode::Const, 0),
                (Opcode::Leave, 8),
                (Opcode::Enter, 8),
                (Opcode::Const, 1),
                (Opcode::Leave, 8),
            ])
            .build();
        let image = Image::parse(&bytes).unwrap();
        let symbols = SymbolTable::parse("0 0 vmMain\n");

        let listing = disassemble(&image, Some(&symbols));
        assert!(listing.contains("\nvmMain:\n"));
        assert!(listing.contains("\nproc_3:\n"));
        assert!(listing.contains("CONST 1"));
    }
}
