use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use crate::demangle::maybe_demangle;
use crate::log::debug;
use crate::log::warn;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Reason;
use crate::Result;
use crate::Sym;
use crate::SymbolCache;

/// The default location of the kernel's symbol table.
pub const KALLSYMS: &str = "/proc/kallsyms";
const DFL_KSYM_CAP: usize = 200000;


/// Check whether a kallsyms symbol type character denotes a text
/// (code) symbol, be it global, local, or weak.
#[inline]
fn is_text_type(typ: &str) -> bool {
    matches!(typ, "t" | "T" | "w" | "W")
}


/// Parse kallsyms formatted data, invoking `f` with the name, kernel
/// module name (if any), and address of every text symbol with a
/// non-zero address.
pub(crate) fn parse_kallsyms<R, F>(reader: R, mut f: F) -> Result<()>
where
    R: Read,
    F: FnMut(&str, Option<&str>, Addr),
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        let () = line.clear();
        let sz = reader.read_line(&mut line)?;
        if sz == 0 {
            break
        }

        let mut tokens = line.split_ascii_whitespace();

        #[rustfmt::skip]
        let (addr, typ, name) = {
            let addr = if let Some(token) = tokens.next() { token } else { continue };
            let typ = if let Some(token) = tokens.next() { token } else { continue };
            let name = if let Some(token) = tokens.next() { token } else { continue };
            (addr, typ, name)
        };
        let module = tokens
            .next()
            .and_then(|module| module.strip_prefix('['))
            .and_then(|module| module.strip_suffix(']'));

        if !is_text_type(typ) {
            continue
        }

        // Addresses are reported as zero if `kptr_restrict` hides them
        // from us.
        match Addr::from_str_radix(addr, 16) {
            Ok(0) | Err(..) => continue,
            Ok(addr) => f(name, module, addr),
        }
    }
    Ok(())
}


#[derive(Debug)]
struct Ksym {
    addr: Addr,
    name: Box<str>,
    /// Index into the table's list of kernel module names.
    module: Option<usize>,
}


/// A cache of the kernel's symbol table, as exposed by
/// `/proc/kallsyms`.
///
/// The table is read on first use. Because kallsyms carries no symbol
/// sizes, an address resolves to the closest symbol preceding it.
pub struct KernelSymbolTable {
    path: PathBuf,
    /// All symbols, sorted by address.
    syms: Vec<Ksym>,
    /// Kernel module names, referenced by index from `syms`.
    modules: Vec<Box<str>>,
    /// Map from symbol name to the lowest address using that name.
    by_name: HashMap<Box<str>, Addr>,
    loaded: bool,
}

impl KernelSymbolTable {
    /// Create a table for the running kernel's symbols.
    pub fn new() -> Self {
        Self::with_path(KALLSYMS)
    }

    /// Create a table reading kallsyms formatted data from the provided
    /// `path`, e.g., a copy obtained from a different system.
    pub fn with_path<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
            syms: Vec::new(),
            modules: Vec::new(),
            by_name: HashMap::new(),
            loaded: false,
        }
    }

    /// Retrieve the path the table is read from.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retrieve the number of symbols currently in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Check whether the table currently contains no symbols.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    fn clear(&mut self) {
        let () = self.syms.clear();
        let () = self.modules.clear();
        let () = self.by_name.clear();
    }

    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all, fields(path = ?self.path)))]
    fn load(&mut self) -> Result<()> {
        let () = self.clear();

        let file = File::open(&self.path)
            .with_context(|| format!("failed to open `{}`", self.path.display()))?;
        let mut syms = Vec::with_capacity(DFL_KSYM_CAP);
        let mut modules = Vec::<Box<str>>::new();
        let mut module_idx = HashMap::<Box<str>, usize>::new();

        let () = parse_kallsyms(file, |name, module, addr| {
            let module = module.map(|module| match module_idx.get(module) {
                Some(idx) => *idx,
                None => {
                    let idx = modules.len();
                    let () = modules.push(Box::from(module));
                    let _prev = module_idx.insert(Box::from(module), idx);
                    idx
                }
            });

            let ksym = Ksym {
                addr,
                name: Box::from(name),
                module,
            };
            let () = syms.push(ksym);
        })
        .with_context(|| format!("failed to parse `{}`", self.path.display()))?;

        // Stable sorting, so that symbols sharing an address stay in
        // file order.
        let () = syms.sort_by_key(|ksym| ksym.addr);

        let mut by_name = HashMap::with_capacity(syms.len());
        for ksym in &syms {
            if let Entry::Vacant(entry) = by_name.entry(ksym.name.clone()) {
                let _addr = entry.insert(ksym.addr);
            }
        }

        debug!(
            "loaded {} kernel symbols from `{}`",
            syms.len(),
            self.path.display()
        );

        self.syms = syms;
        self.modules = modules;
        self.by_name = by_name;
        Ok(())
    }

    fn ensure_loaded(&mut self) {
        if !self.loaded {
            self.loaded = true;
            if let Err(err) = self.load() {
                warn!("failed to load kernel symbols: {err:#}");
            }
        }
    }
}

impl Default for KernelSymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolCache for KernelSymbolTable {
    fn refresh(&mut self) -> Result<()> {
        self.loaded = true;
        self.load()
    }

    fn resolve_addr(&mut self, addr: Addr, demangle: bool) -> Result<Sym<'_>, Reason> {
        let () = self.ensure_loaded();

        if self.syms.is_empty() {
            return Err(Reason::MissingSyms)
        }

        let idx = find_match_or_lower_bound_by_key(&self.syms, addr, |ksym| ksym.addr)
            .ok_or(Reason::UnknownAddr)?;
        let ksym = &self.syms[idx];
        let sym = Sym {
            // Kernels with Rust support export mangled names.
            name: maybe_demangle(&ksym.name, demangle),
            module: ksym.module.map(|idx| &*self.modules[idx]),
            addr: ksym.addr,
            size: None,
            offset: (addr - ksym.addr) as usize,
        };
        Ok(sym)
    }

    fn resolve_name(&mut self, _module: Option<&str>, name: &str) -> Result<Addr, Reason> {
        let () = self.ensure_loaded();

        if self.syms.is_empty() {
            return Err(Reason::MissingSyms)
        }
        self.by_name.get(name).copied().ok_or(Reason::UnknownName)
    }
}

impl Debug for KernelSymbolTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "KernelSymbolTable(\"{}\")", self.path.display())
    }
}
