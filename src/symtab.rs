//! Address and name indexed symbol tables of binaries.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use crate::elf::find_debug_file;
use crate::elf::ElfParser;
use crate::elf::SymTable;
use crate::log::debug;
use crate::log::warn;
use crate::Addr;
use crate::IntoError as _;
use crate::Reason;
use crate::Result;
use crate::SymbolOptions;


/// The name of a symbol, either already read or referencing the string
/// table it is stored in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SymName {
    /// The name has been read.
    Resolved(Box<str>),
    /// The name is yet to be read from a string table.
    Lazy {
        /// The index of the string table section.
        section_idx: u32,
        /// The offset of the name inside the string table.
        str_table_idx: u32,
        /// The length of the name, excluding the NUL terminator.
        str_len: u32,
        /// Whether the string table belongs to the binary's separate
        /// debug file rather than to the binary itself.
        from_debug_file: bool,
    },
}

impl SymName {
    /// Retrieve the name if it has been resolved.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Resolved(name) => Some(name),
            Self::Lazy { .. } => None,
        }
    }
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Symbol {
    pub name: SymName,
    pub start: Addr,
    pub size: u64,
}

impl Symbol {
    /// Retrieve the (exclusive) end address of the symbol. A symbol of
    /// size zero only covers its start address.
    #[inline]
    fn end(&self) -> Addr {
        self.start.saturating_add(self.size.max(1))
    }

    #[inline]
    fn covers(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end()
    }

    /// Retrieve the symbol's name, or an empty string if it has not
    /// been resolved yet.
    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str().unwrap_or("")
    }
}


/// The ELF files lazily loaded names are read from.
#[derive(Debug)]
pub(crate) struct LazyParsers<'path> {
    binary: &'path Path,
    debug_file: Option<&'path Path>,
    main: Option<ElfParser>,
    debug: Option<ElfParser>,
}

impl<'path> LazyParsers<'path> {
    pub fn new(binary: &'path Path, debug_file: Option<&'path Path>) -> Self {
        Self {
            binary,
            debug_file,
            main: None,
            debug: None,
        }
    }

    fn get(&mut self, from_debug_file: bool) -> Result<&ElfParser> {
        let (slot, path) = if from_debug_file {
            let path = self
                .debug_file
                .ok_or_invalid_data(|| "symbol references unknown debug file")?;
            (&mut self.debug, path)
        } else {
            (&mut self.main, self.binary)
        };

        if slot.is_none() {
            *slot = Some(ElfParser::open(path)?);
        }
        slot.as_ref()
            .ok_or_invalid_data(|| "failed to open ELF file for symbol names")
    }

    /// Read a lazily loaded name, replacing it in place.
    fn materialize(&mut self, name: &mut SymName) -> Result<()> {
        if let SymName::Lazy {
            section_idx,
            str_table_idx,
            str_len,
            from_debug_file,
        } = *name
        {
            let parser = self.get(from_debug_file)?;
            let resolved = parser.read_str(
                section_idx as usize,
                str_table_idx as usize,
                str_len as usize,
            )?;
            *name = SymName::Resolved(Box::from(resolved));
        }
        Ok(())
    }
}


/// A table of symbols, searchable by address and by name.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    /// All symbols, ordered by start address, with symbols sharing an
    /// address ordered by descending size.
    syms: Vec<Symbol>,
    /// `max_ends[i]` is the largest end address of all symbols up to
    /// and including `syms[i]`.
    max_ends: Vec<Addr>,
    /// Indexes into `syms`, ordered by name. Created on first use.
    by_name: Option<Box<[usize]>>,
}

impl SymbolTable {
    pub fn new(mut syms: Vec<Symbol>) -> Self {
        let () = syms.sort_by(|sym1, sym2| {
            sym1.start
                .cmp(&sym2.start)
                .then_with(|| sym1.size.cmp(&sym2.size).reverse())
        });

        let max_ends = syms
            .iter()
            .scan(0, |max_end, sym| {
                *max_end = Addr::max(*max_end, sym.end());
                Some(*max_end)
            })
            .collect();

        Self {
            syms,
            max_ends,
            by_name: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Retrieve the symbol at index `idx`.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Symbol> {
        self.syms.get(idx)
    }

    /// Find the index of the innermost symbol covering `addr`.
    pub fn find_addr(&self, addr: Addr) -> Result<usize, Reason> {
        if self.syms.is_empty() {
            return Err(Reason::MissingSyms)
        }

        let mut idx = self.syms.partition_point(|sym| sym.start <= addr);
        while idx > 0 {
            idx -= 1;
            // No symbol at or before `idx` reaches `addr`.
            if self.max_ends[idx] <= addr {
                break
            }
            if self.syms[idx].covers(addr) {
                return Ok(idx)
            }
        }
        Err(Reason::UnknownAddr)
    }

    /// Make sure the name of the symbol at `idx` is resolved.
    pub fn materialize(&mut self, idx: usize, parsers: &mut LazyParsers<'_>) -> Result<()> {
        let sym = self
            .syms
            .get_mut(idx)
            .ok_or_invalid_input(|| format!("symbol index ({idx}) out of bounds"))?;
        parsers.materialize(&mut sym.name)
    }

    fn ensure_by_name(&mut self, parsers: &mut LazyParsers<'_>) -> Result<()> {
        if self.by_name.is_none() {
            for sym in self.syms.iter_mut() {
                let () = parsers.materialize(&mut sym.name)?;
            }

            let syms = &self.syms;
            let mut by_name = (0..syms.len()).collect::<Box<[_]>>();
            let () = by_name.sort_by(|idx1, idx2| {
                let sym1 = &syms[*idx1];
                let sym2 = &syms[*idx2];
                sym1.name()
                    .cmp(sym2.name())
                    .then_with(|| sym1.start.cmp(&sym2.start))
            });
            self.by_name = Some(by_name);
        }
        Ok(())
    }

    /// Find the symbol with the given name. If multiple symbols share
    /// the name, the one with the lowest address is reported.
    pub fn find_name(
        &mut self,
        name: &str,
        parsers: &mut LazyParsers<'_>,
    ) -> Result<Option<&Symbol>> {
        let () = self.ensure_by_name(parsers)?;
        let by_name = self
            .by_name
            .as_deref()
            .ok_or_invalid_data(|| "symbol name index is missing")?;
        let syms = &self.syms;
        let idx = by_name.partition_point(|idx| syms[*idx].name() < name);
        let sym = by_name
            .get(idx)
            .map(|idx| &syms[*idx])
            .filter(|sym| sym.name() == name);
        Ok(sym)
    }
}


fn add_symbols(
    table: &SymTable<'_>,
    opts: &SymbolOptions,
    from_debug_file: bool,
    skip: &HashSet<Addr>,
    syms: &mut Vec<Symbol>,
) -> Result<()> {
    let section_idx = u32::try_from(table.strtab_idx)
        .ok()
        .ok_or_invalid_data(|| "string table section index is too large")?;

    for sym in table.syms {
        if !sym.matches(opts.sym_type)
            || !sym.is_defined()
            || sym.st_value == 0
            || sym.st_name == 0
            || skip.contains(&sym.st_value)
        {
            continue
        }

        let name = table.name(sym)?;
        if name.is_empty() {
            continue
        }

        let name = if opts.lazy {
            SymName::Lazy {
                section_idx,
                str_table_idx: sym.st_name,
                str_len: u32::try_from(name.len())
                    .ok()
                    .ok_or_invalid_data(|| "symbol name is too long")?,
                from_debug_file,
            }
        } else {
            SymName::Resolved(Box::from(name))
        };

        let symbol = Symbol {
            name,
            start: sym.st_value,
            size: sym.st_size,
        };
        let () = syms.push(symbol);
    }
    Ok(())
}


/// The symbols read from an ELF file and, potentially, its separate
/// debug file.
#[derive(Debug, Default)]
pub(crate) struct ElfSymbols {
    pub syms: Vec<Symbol>,
    /// The debug file that some of the symbols got read from.
    pub debug_path: Option<PathBuf>,
}

/// Read the symbols of the ELF file at `path`.
///
/// Symbols are read from `.symtab` and `.dynsym`, with dynamic symbols
/// at addresses already covered by `.symtab` being skipped. If the
/// binary lacks a `.symtab` section, its separate debug file is
/// consulted, if enabled.
#[cfg_attr(feature = "tracing", crate::log::instrument(skip(parser, opts)))]
pub(crate) fn read_elf_symbols(
    parser: &ElfParser,
    path: &Path,
    opts: &SymbolOptions,
) -> Result<ElfSymbols> {
    let mut syms = Vec::new();
    let mut seen = HashSet::new();

    let symtab = parser.symbol_table(".symtab")?;
    let has_symtab = symtab.is_some();
    if let Some(table) = symtab {
        let () = add_symbols(&table, opts, false, &seen, &mut syms)?;
        let () = seen.extend(syms.iter().map(|sym| sym.start));
    }

    if let Some(table) = parser.symbol_table(".dynsym")? {
        let () = add_symbols(&table, opts, false, &seen, &mut syms)?;
        let () = seen.extend(syms.iter().map(|sym| sym.start));
    }

    let mut debug_path = None;
    if opts.debug_file && !has_symtab {
        match find_debug_file(path, parser, opts) {
            Ok(Some(debug_file)) => match ElfParser::open(&debug_file) {
                Ok(debug_parser) => {
                    if let Some(table) = debug_parser.symbol_table(".symtab")? {
                        debug!(
                            "reading symbols of `{}` from `{}`",
                            path.display(),
                            debug_file.display()
                        );
                        let () = add_symbols(&table, opts, true, &seen, &mut syms)?;
                        debug_path = Some(debug_file);
                    }
                }
                Err(err) => warn!("failed to open debug file: {err:#}"),
            },
            Ok(None) => debug!("no debug file found for `{}`", path.display()),
            Err(err) => debug!(
                "failed to search debug file of `{}`: {err:#}",
                path.display()
            ),
        }
    }

    let symbols = ElfSymbols { syms, debug_path };
    Ok(symbols)
}
