//! # Symbol oracle
//!
//! The core does not parse line tables or DWARF itself; that is the job of
//! the symbol layer above it. What the core needs from that layer is small
//! and is captured by the [`SymbolOracle`] trait: mapping program counters
//! to source locations and back, finding function entry points, and telling
//! the core where the runtime keeps its goroutine bookkeeping.
//!
//! [`TableOracle`] is the implementation shipped with this crate: a plain
//! lookup table that can be populated programmatically or primed with the
//! function symbols of an executable via the [object] crate. A DWARF-backed
//! oracle plugs in through the same trait.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;

use object::{Object, ObjectSymbol};
use serde::Serialize;
use tracing::debug;

use crate::addr::Addr;
use crate::errors::Result;

/// A source location resolved from a program counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub pc: Addr,
    pub file: String,
    pub line: u64,
    pub function: String,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({}) {}", self.file, self.line, self.pc, self.function)
    }
}

/// Field offsets into the runtime's goroutine descriptor struct, as
/// extracted from debug information by the symbol layer.
#[derive(Debug, Clone, Copy)]
pub struct GoroutineLayout {
    /// Offset of the goroutine id field.
    pub id: usize,
    /// Offset of the status field.
    pub status: usize,
    /// Offset of the PC of the `go` statement that created the goroutine.
    pub go_pc: usize,
    /// Offset of the saved scheduler PC (where the goroutine parked).
    pub sched_pc: usize,
}

/// What the process-control core consumes from the symbol layer.
pub trait SymbolOracle: Send + Sync {
    /// Resolve a program counter to file, line and function.
    fn pc_to_line(&self, pc: Addr) -> Option<Location>;

    /// Resolve a file:line pair to the first program counter of that line.
    fn line_to_pc(&self, file: &str, line: u64) -> Option<Addr>;

    /// Entry point of a function, by fully qualified name.
    fn function_entry(&self, name: &str) -> Option<Addr>;

    /// First program counter after the prologue of a function. Breakpoints
    /// meant to observe function arguments belong here, not at the entry.
    fn first_pc_after_prologue(&self, name: &str) -> Option<Addr>;

    /// Name of the function containing a program counter.
    fn function_of(&self, pc: Addr) -> Option<String>;

    /// Program counters of every source line of a function, in address
    /// order. Used to plant the temporary breakpoints of a `next`.
    fn line_addresses(&self, function: &str) -> Vec<Addr>;

    /// Compile-unit producer strings.
    fn producers(&self) -> Vec<String>;

    /// Address of a global variable, by fully qualified name
    /// (e.g. `runtime.allglen`).
    fn global_address(&self, name: &str) -> Option<Addr>;

    /// Layout of the runtime's goroutine descriptor, if the target has one.
    fn goroutine_layout(&self) -> Option<GoroutineLayout>;

    /// Whether the target was linked with an external linker. Detected the
    /// same way the original toolchain does it: a compile unit produced by
    /// GNU AS.
    fn built_with_external_linker(&self) -> bool {
        self.producers().iter().any(|p| p.starts_with("GNU AS"))
    }
}

#[derive(Debug, Clone)]
struct FuncSym {
    name: String,
    entry: Addr,
    end: Addr,
    file: String,
    line: u64,
    /// End of the prologue; falls back to `entry` when unknown.
    prologue_end: Option<Addr>,
    /// PCs of the source lines of this function, in address order.
    line_pcs: Vec<(u64, Addr)>,
}

/// A table-backed [`SymbolOracle`].
#[derive(Default)]
pub struct TableOracle {
    functions: Vec<FuncSym>,
    globals: HashMap<String, Addr>,
    producers: Vec<String>,
    layout: Option<GoroutineLayout>,
}

impl TableOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prime the table with the function symbols of an executable.
    ///
    /// Only the symbol table is consulted, so locations resolved through
    /// the result carry the function name but no line numbers. Good enough
    /// to set breakpoints by symbol; a DWARF oracle supersedes it.
    pub fn from_executable(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        let obj = object::File::parse(&*raw)?;

        let mut oracle = Self::new();
        let file = path.to_string_lossy().to_string();
        for sym in obj.symbols() {
            if sym.kind() != object::SymbolKind::Text || sym.size() == 0 {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            oracle.functions.push(FuncSym {
                name: name.to_string(),
                entry: Addr::from(sym.address()),
                end: Addr::from(sym.address() + sym.size()),
                file: file.clone(),
                line: 0,
                prologue_end: None,
                line_pcs: Vec::new(),
            });
        }
        oracle.functions.sort_by_key(|f| f.entry);
        debug!(
            "loaded {} function symbols from {file}",
            oracle.functions.len()
        );
        Ok(oracle)
    }

    pub fn add_function(
        &mut self,
        name: &str,
        entry: Addr,
        end: Addr,
        file: &str,
        line: u64,
    ) -> &mut Self {
        self.functions.push(FuncSym {
            name: name.to_string(),
            entry,
            end,
            file: file.to_string(),
            line,
            prologue_end: None,
            line_pcs: Vec::new(),
        });
        self.functions.sort_by_key(|f| f.entry);
        self
    }

    pub fn add_prologue_end(&mut self, name: &str, pc: Addr) -> &mut Self {
        if let Some(f) = self.functions.iter_mut().find(|f| f.name == name) {
            f.prologue_end = Some(pc);
        }
        self
    }

    pub fn add_line(&mut self, function: &str, line: u64, pc: Addr) -> &mut Self {
        if let Some(f) = self.functions.iter_mut().find(|f| f.name == function) {
            f.line_pcs.push((line, pc));
            f.line_pcs.sort_by_key(|&(_, pc)| pc);
        }
        self
    }

    pub fn add_global(&mut self, name: &str, addr: Addr) -> &mut Self {
        self.globals.insert(name.to_string(), addr);
        self
    }

    pub fn add_producer(&mut self, producer: &str) -> &mut Self {
        self.producers.push(producer.to_string());
        self
    }

    pub fn set_goroutine_layout(&mut self, layout: GoroutineLayout) -> &mut Self {
        self.layout = Some(layout);
        self
    }

    fn func_at(&self, pc: Addr) -> Option<&FuncSym> {
        self.functions
            .iter()
            .find(|f| f.entry <= pc && pc < f.end)
    }
}

impl SymbolOracle for TableOracle {
    fn pc_to_line(&self, pc: Addr) -> Option<Location> {
        let f = self.func_at(pc)?;
        // The most precise line whose PC does not lie past the query.
        let line = f
            .line_pcs
            .iter()
            .take_while(|&&(_, lpc)| lpc <= pc)
            .last()
            .map(|&(l, _)| l)
            .unwrap_or(f.line);
        Some(Location {
            pc,
            file: f.file.clone(),
            line,
            function: f.name.clone(),
        })
    }

    fn line_to_pc(&self, file: &str, line: u64) -> Option<Addr> {
        self.functions
            .iter()
            .filter(|f| f.file == file)
            .flat_map(|f| f.line_pcs.iter())
            .find(|&&(l, _)| l == line)
            .map(|&(_, pc)| pc)
    }

    fn function_entry(&self, name: &str) -> Option<Addr> {
        self.functions
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.entry)
    }

    fn first_pc_after_prologue(&self, name: &str) -> Option<Addr> {
        let f = self.functions.iter().find(|f| f.name == name)?;
        Some(f.prologue_end.unwrap_or(f.entry))
    }

    fn function_of(&self, pc: Addr) -> Option<String> {
        self.func_at(pc).map(|f| f.name.clone())
    }

    fn line_addresses(&self, function: &str) -> Vec<Addr> {
        self.functions
            .iter()
            .find(|f| f.name == function)
            .map(|f| f.line_pcs.iter().map(|&(_, pc)| pc).collect())
            .unwrap_or_default()
    }

    fn producers(&self) -> Vec<String> {
        self.producers.clone()
    }

    fn global_address(&self, name: &str) -> Option<Addr> {
        self.globals.get(name).copied()
    }

    fn goroutine_layout(&self) -> Option<GoroutineLayout> {
        self.layout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn oracle() -> TableOracle {
        let mut o = TableOracle::new();
        o.add_function("main.main", Addr::from(0x1000usize), Addr::from(0x1080usize), "main.go", 5);
        o.add_line("main.main", 5, Addr::from(0x1000usize));
        o.add_line("main.main", 6, Addr::from(0x1020usize));
        o.add_line("main.main", 7, Addr::from(0x1040usize));
        o.add_prologue_end("main.main", Addr::from(0x1008usize));
        o
    }

    #[test]
    fn test_pc_to_line_picks_enclosing_line() {
        let o = oracle();
        let loc = o.pc_to_line(Addr::from(0x1024usize)).unwrap();
        assert_eq!(loc.function, "main.main");
        assert_eq!(loc.line, 6);
        assert!(o.pc_to_line(Addr::from(0x2000usize)).is_none());
    }

    #[test]
    fn test_line_to_pc() {
        let o = oracle();
        assert_eq!(o.line_to_pc("main.go", 7), Some(Addr::from(0x1040usize)));
        assert_eq!(o.line_to_pc("other.go", 7), None);
    }

    #[test]
    fn test_prologue_end() {
        let o = oracle();
        assert_eq!(
            o.first_pc_after_prologue("main.main"),
            Some(Addr::from(0x1008usize))
        );
    }

    #[test]
    fn test_external_linker_detection() {
        let mut o = oracle();
        assert!(!o.built_with_external_linker());
        o.add_producer("GNU AS 2.38");
        assert!(o.built_with_external_linker());
    }
}
