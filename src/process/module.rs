use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

use crate::demangle::maybe_demangle;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_EXEC;
use crate::elf::ElfParser;
use crate::elf::TextInfo;
use crate::log::debug;
use crate::log::warn;
use crate::symtab::read_elf_symbols;
use crate::symtab::LazyParsers;
use crate::symtab::SymName;
use crate::symtab::Symbol;
use crate::symtab::SymbolTable;
use crate::Addr;
use crate::Reason;
use crate::Result;
use crate::Sym;
use crate::SymbolOptions;

use super::path::ModulePathResolver;
use super::perf_map::is_valid_perf_map;
use super::perf_map::read_perf_map;
use super::vdso::create_vdso_parser;
use super::vdso::VDSO_COMPONENT;


/// The type of a module mapped into a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleType {
    /// The module's type could not be determined. Such a module never
    /// yields symbols.
    Unknown,
    /// A non-relocatable executable.
    Exec,
    /// A shared object or position independent executable.
    So,
    /// A perf map file, as written by JIT compilers.
    PerfMap,
    /// The virtual dynamic shared object provided by the kernel.
    Vdso,
}


/// A memory range a module is mapped at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapRange {
    /// The start address of the range.
    pub start: Addr,
    /// The (exclusive) end address of the range.
    pub end: Addr,
    /// The offset of the range's start in the mapped file.
    pub file_offset: u64,
}

impl MapRange {
    #[inline]
    fn contains(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end
    }
}


/// A read-only view of a module of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleInfo<'module> {
    /// The module's name, typically the path of the mapped file as seen
    /// by the process.
    pub name: &'module str,
    /// The module's type.
    pub module_type: ModuleType,
    /// The memory ranges the module is mapped at.
    pub ranges: &'module [MapRange],
}


/// Determine the type of the module at `path`, along with the location
/// of its `.text` section, if relevant.
fn discover(name: &str, path: &Path) -> (ModuleType, Option<TextInfo>) {
    if name == VDSO_COMPONENT {
        let text = create_vdso_parser().and_then(|parser| parser.text_info());
        match text {
            Ok(text) => return (ModuleType::Vdso, text),
            Err(err) => {
                debug!("failed to inspect vDSO: {err:#}");
                return (ModuleType::Vdso, None)
            }
        }
    }

    match ElfParser::open(path) {
        Ok(parser) => match parser.elf_type() {
            ET_EXEC => (ModuleType::Exec, None),
            ET_DYN => {
                let text = parser.text_info().unwrap_or_else(|err| {
                    debug!("failed to find `.text` of `{}`: {err:#}", path.display());
                    None
                });
                (ModuleType::So, text)
            }
            type_ => {
                debug!("`{}` has unsupported ELF type {type_}", path.display());
                (ModuleType::Unknown, None)
            }
        },
        Err(..) if is_valid_perf_map(path) => (ModuleType::PerfMap, None),
        Err(err) => {
            debug!("failed to determine type of `{}`: {err:#}", path.display());
            (ModuleType::Unknown, None)
        }
    }
}


/// A binary or other symbol source mapped into a process.
#[derive(Debug)]
pub(crate) struct Module {
    name: String,
    path: ModulePathResolver,
    ranges: Vec<MapRange>,
    /// Whether an attempt at loading symbols has been made.
    loaded: bool,
    type_: ModuleType,
    symbols: SymbolTable,
    /// The virtual address of the module's `.text` section.
    elf_so_addr: u64,
    /// The file offset of the module's `.text` section.
    elf_so_offset: u64,
    /// The separate debug file some of the symbols were read from.
    debug_path: Option<PathBuf>,
    inode: u64,
}

impl Module {
    /// Create a module, determining its type from the file `path`
    /// refers to.
    pub fn new(name: String, path: ModulePathResolver, inode: u64) -> Self {
        let (type_, text) = discover(&name, path.path());
        let text = text.unwrap_or_default();

        Self {
            name,
            path,
            ranges: Vec::new(),
            loaded: false,
            type_,
            symbols: SymbolTable::default(),
            elf_so_addr: text.addr,
            elf_so_offset: text.offset,
            debug_path: None,
            inode,
        }
    }

    /// Create the perf map pseudo-module, spanning the full address
    /// space.
    pub fn perf_map(name: String, path: ModulePathResolver) -> Self {
        Self {
            name,
            path,
            ranges: vec![MapRange {
                start: 0,
                end: Addr::MAX,
                file_offset: 0,
            }],
            loaded: false,
            type_: ModuleType::PerfMap,
            symbols: SymbolTable::default(),
            elf_so_addr: 0,
            elf_so_offset: 0,
            debug_path: None,
            inode: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn type_(&self) -> ModuleType {
        self.type_
    }

    #[inline]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    #[inline]
    pub fn ranges(&self) -> &[MapRange] {
        &self.ranges
    }

    #[inline]
    pub fn info(&self) -> ModuleInfo<'_> {
        ModuleInfo {
            name: &self.name,
            module_type: self.type_,
            ranges: &self.ranges,
        }
    }

    #[inline]
    pub fn add_range(&mut self, range: MapRange) {
        let () = self.ranges.push(range);
    }

    #[inline]
    pub fn clear_ranges(&mut self) {
        let () = self.ranges.clear();
    }

    /// Check whether the module is referred to by `module`, either by
    /// its full name or by its file name.
    pub fn matches_name(&self, module: &str) -> bool {
        self.name == module || Path::new(&self.name).file_name() == Some(OsStr::new(module))
    }

    #[inline]
    fn is_relocatable(&self) -> bool {
        matches!(self.type_, ModuleType::So | ModuleType::Vdso)
    }

    /// Check whether `addr` is covered by one of the module's ranges
    /// and, if so, translate it into the address space its symbols are
    /// expressed in.
    pub fn contains(&self, addr: Addr) -> Option<u64> {
        let range = self.ranges.iter().find(|range| range.contains(addr))?;
        let offset = if self.is_relocatable() {
            addr.wrapping_sub(range.start.wrapping_sub(range.file_offset))
                .wrapping_add(self.elf_so_addr.wrapping_sub(self.elf_so_offset))
        } else {
            addr
        };
        Some(offset)
    }

    /// Load the module's symbols, unless an attempt has been made
    /// already.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all, fields(module = %self.name)))]
    pub fn load_sym_table(&mut self, opts: &SymbolOptions) {
        if self.loaded {
            return
        }
        self.loaded = true;

        let result = match self.type_ {
            ModuleType::Exec | ModuleType::So => self.load_elf(opts),
            ModuleType::Vdso => self.load_vdso(opts),
            ModuleType::PerfMap => self.load_perf_map(),
            ModuleType::Unknown => Ok(()),
        };

        match result {
            Ok(()) => debug!("loaded {} symbols of `{}`", self.symbols.len(), self.name),
            Err(err) => warn!("failed to load symbols of `{}`: {err:#}", self.name),
        }
    }

    fn load_elf(&mut self, opts: &SymbolOptions) -> Result<()> {
        let path = self.path.path();
        let parser = ElfParser::open(path)?;
        let symbols = read_elf_symbols(&parser, path, opts)?;
        self.symbols = SymbolTable::new(symbols.syms);
        self.debug_path = symbols.debug_path;
        Ok(())
    }

    fn load_vdso(&mut self, opts: &SymbolOptions) -> Result<()> {
        let parser = create_vdso_parser()?;
        // The vDSO image is not backed by a file names could be read
        // from later on.
        let opts = SymbolOptions {
            debug_file: false,
            lazy: false,
            ..opts.clone()
        };
        let symbols = read_elf_symbols(&parser, Path::new(VDSO_COMPONENT), &opts)?;
        self.symbols = SymbolTable::new(symbols.syms);
        Ok(())
    }

    fn load_perf_map(&mut self) -> Result<()> {
        let mut syms = Vec::new();
        let () = read_perf_map(self.path.path(), |function| {
            let sym = Symbol {
                name: SymName::Resolved(Box::from(function.name)),
                start: function.addr,
                size: function.size,
            };
            syms.push(sym)
        })?;
        self.symbols = SymbolTable::new(syms);
        Ok(())
    }

    /// Find the index of the symbol covering `offset`, an address as
    /// reported by [`Module::contains`].
    #[inline]
    pub fn find_addr(&self, offset: u64) -> Result<usize, Reason> {
        self.symbols.find_addr(offset)
    }

    /// Make sure that the name of the symbol at index `idx` has been
    /// read.
    pub fn materialize(&mut self, idx: usize) -> Result<(), Reason> {
        let mut parsers = LazyParsers::new(self.path.path(), self.debug_path.as_deref());
        self.symbols.materialize(idx, &mut parsers).map_err(|err| {
            warn!("failed to read symbol name from `{}`: {err:#}", self.name);
            Reason::MissingSyms
        })
    }

    /// Report the (already materialized) symbol at index `idx` as
    /// covering `offset`.
    pub fn sym(&self, idx: usize, offset: u64, demangle: bool) -> Result<Sym<'_>, Reason> {
        let sym = self.symbols.get(idx).ok_or(Reason::UnknownAddr)?;
        let name = sym.name.as_str().ok_or(Reason::MissingSyms)?;
        let sym = Sym {
            name: maybe_demangle(name, demangle),
            module: Some(&self.name),
            addr: sym.start,
            size: Some(sym.size as usize),
            offset: offset.saturating_sub(sym.start) as usize,
        };
        Ok(sym)
    }

    /// Find the symbol covering `offset`, an address as reported by
    /// [`Module::contains`].
    pub fn find_sym(&mut self, offset: u64, demangle: bool) -> Result<Sym<'_>, Reason> {
        let idx = self.find_addr(offset)?;
        let () = self.materialize(idx)?;
        self.sym(idx, offset, demangle)
    }

    /// Find the process address of the symbol with the given name.
    pub fn find_name(&mut self, name: &str) -> Option<Addr> {
        let mut parsers = LazyParsers::new(self.path.path(), self.debug_path.as_deref());
        let start = match self.symbols.find_name(name, &mut parsers) {
            Ok(sym) => sym?.start,
            Err(err) => {
                warn!("failed to index symbol names of `{}`: {err:#}", self.name);
                return None
            }
        };

        if self.is_relocatable() {
            let range = self.ranges.first()?;
            let addr = start
                .wrapping_sub(self.elf_so_addr.wrapping_sub(self.elf_so_offset))
                .wrapping_add(range.start.wrapping_sub(range.file_offset));
            Some(addr)
        } else {
            Some(start)
        }
    }
}
