//! Registry summaries for operators and crash reports.

use std::fmt;
use std::io::{Cursor, Write};

use serde::Serialize;

use crate::config::ExecutionMode;
use crate::instance::ModuleInstance;

/// Summary of every loaded module, in slot order.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryInfo {
    /// Loaded modules
    pub modules: Vec<ModuleInfo>,
}

/// Summary of one module. Sizes are absent for native modules.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// Module name
    pub name: String,
    /// Backend in use
    pub mode: ExecutionMode,
    /// Code section length in bytes
    pub code_length: Option<i32>,
    /// Instruction table length in bytes (four per instruction)
    pub table_length: Option<u32>,
    /// Sandbox size in bytes
    pub data_length: Option<u32>,
}

impl ModuleInfo {
    pub(crate) fn from_instance(instance: &ModuleInstance) -> Self {
        Self {
            name: instance.name().to_string(),
            mode: instance.mode(),
            code_length: instance.header().map(|h| h.code_length),
            table_length: instance.program().map(|p| p.len() as u32 * 4),
            data_length: instance.data_mask().map(|mask| mask.wrapping_add(1)),
        }
    }
}

impl fmt::Display for RegistryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Registered virtual machines:")?;
        for module in &self.modules {
            write!(f, "{} : ", module.name)?;
            match module.mode {
                ExecutionMode::Native => {
                    writeln!(f, "native")?;
                    continue;
                }
                ExecutionMode::Compiled => writeln!(f, "compiled on load")?,
                ExecutionMode::Interpreted => writeln!(f, "interpreted")?,
            }
            writeln!(f, "    code length : {:7}", module.code_length.unwrap_or(0))?;
            writeln!(f, "    table length: {:7}", module.table_length.unwrap_or(0))?;
            writeln!(f, "    data length : {:7}", module.data_length.unwrap_or(0))?;
        }
        Ok(())
    }
}

/// Write the crash summary of `instance` into `buf`, cutting what does not
/// fit. Returns the bytes written.
pub(crate) fn write_crash_dump(instance: &ModuleInstance, buf: &mut [u8]) -> usize {
    let mut out = Cursor::new(buf);
    // A full buffer ends the dump early; what fit is kept.
    let _ = dump(instance, &mut out);
    out.position() as usize
}

fn dump(instance: &ModuleInstance, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "vm: {}", instance.name())?;
    writeln!(out, "mode: {}", instance.mode())?;
    writeln!(out, "call level: {}", instance.call_level())?;
    let (Some(sandbox), Some(header), Some(program)) =
        (instance.sandbox(), instance.header(), instance.program())
    else {
        return Ok(());
    };
    writeln!(out, "program stack: 0x{:x}", instance.program_stack().unwrap_or(0))?;
    writeln!(out, "stack bottom: 0x{:x}", instance.stack_bottom().unwrap_or(0))?;
    writeln!(out, "data base: {:p}", sandbox.segment().as_ptr())?;
    writeln!(out, "data size: {}", sandbox.size())?;
    writeln!(out, "code length: {}", header.code_length)?;
    writeln!(out, "instruction count: {}", program.len())?;
    writeln!(out, "jump table targets: {}", program.jump_table().len())?;
    if let Some(pc) = instance.last_pc() {
        write!(out, "last pc: {pc}")?;
        if let Some(symbol) = instance
            .symbols
            .table()
            .and_then(|table| table.lookup(pc as u32))
        {
            write!(out, " ({symbol})")?;
        }
        writeln!(out)?;
    }
    Ok(())
}
