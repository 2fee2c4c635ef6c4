//! Map-file symbols for diagnostics.
//!
//! Map files list one symbol per line as `<segment> <hex-address> <name>`.
//! Only segment 0 (code, addressed by instruction index) is kept.

use std::fmt;

/// Shown when a module has no map file.
pub const NO_MAP_FILE: &str = "[ no map file ]";

/// Shown when an address precedes every known symbol.
pub const NOT_IN_MAP_FILE: &str = "[ not found in map file ]";

/// Code symbols sorted by instruction index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: Vec<(u32, String)>,
}

impl SymbolTable {
    /// Parse map-file text. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut symbols: Vec<(u32, String)> = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let segment = fields.next()?;
                let address = u32::from_str_radix(fields.next()?, 16).ok()?;
                let name = fields.next()?;
                (segment == "0").then(|| (address, name.to_string()))
            })
            .collect();
        symbols.sort_by_key(|(address, _)| *address);
        Self { symbols }
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Name of the symbol starting exactly at `pc`.
    pub fn exact(&self, pc: u32) -> Option<&str> {
        self.symbols
            .binary_search_by_key(&pc, |(address, _)| *address)
            .ok()
            .map(|i| self.symbols[i].1.as_str())
    }

    /// Symbol containing `pc`: its name, or `name+0x<off>` past its start.
    pub fn lookup(&self, pc: u32) -> Option<String> {
        let index = self.symbols.partition_point(|(address, _)| *address <= pc);
        let (address, name) = self.symbols.get(index.checked_sub(1)?)?;
        Some(match pc - address {
            0 => name.clone(),
            offset => format!("{name}+0x{offset:x}"),
        })
    }

    /// Iterate `(instruction index, name)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.symbols.iter().map(|(a, n)| (*a, n.as_str()))
    }
}

/// Lookup result that always renders as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolName {
    /// Resolved symbol
    Found(String),
    /// No map file was available
    NoMapFile,
    /// Map file present but no symbol covers the address
    NotFound,
}

impl SymbolName {
    /// Resolve `pc` against an optional table.
    pub fn resolve(table: Option<&SymbolTable>, pc: i32) -> Self {
        let Some(table) = table else {
            return Self::NoMapFile;
        };
        u32::try_from(pc)
            .ok()
            .and_then(|pc| table.lookup(pc))
            .map_or(Self::NotFound, Self::Found)
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found(name) => f.write_str(name),
            Self::NoMapFile => f.write_str(NO_MAP_FILE),
            Self::NotFound => f.write_str(NOT_IN_MAP_FILE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = "\
0 10 G_RunFrame
1 0 level
0 0 vmMain
0 2a G_Damage
garbage line
0 zz broken
";

    #[test]
    fn test_parse_keeps_code_symbols() {
        let table = SymbolTable::parse(MAP);
        assert_eq!(table.len(), 3);
        let names: Vec<_> = table.iter().map(|(_, n)| n).collect();
        assert_eq!(names, ["vmMain", "G_RunFrame", "G_Damage"]);
    }

    #[test]
    fn test_lookup() {
        let table = SymbolTable::parse(MAP);
        assert_eq!(table.lookup(0).as_deref(), Some("vmMain"));
        assert_eq!(table.lookup(0x10).as_deref(), Some("G_RunFrame"));
        assert_eq!(table.lookup(0x13).as_deref(), Some("G_RunFrame+0x3"));
        assert_eq!(table.lookup(0x100).as_deref(), Some("G_Damage+0xd6"));
        assert_eq!(table.exact(0x2a), Some("G_Damage"));
        assert_eq!(table.exact(0x2b), None);
    }

    #[test]
    fn test_diagnostic_markers() {
        assert_eq!(SymbolName::resolve(None, 5).to_string(), NO_MAP_FILE);
        let table = SymbolTable::parse("0 8 later\n");
        assert_eq!(
            SymbolName::resolve(Some(&table), 2).to_string(),
            NOT_IN_MAP_FILE
        );
        assert_eq!(
            SymbolName::resolve(Some(&table), -1).to_string(),
            NOT_IN_MAP_FILE
        );
        assert_eq!(SymbolName::resolve(Some(&table), 9).to_string(), "later+0x1");
    }
}
