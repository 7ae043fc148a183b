//! **symcache** is a library for resolving addresses to symbols (and
//! symbols to addresses) in the three address spaces a tracing tool
//! typically has to deal with:
//! - the running kernel, based on `/proc/kallsyms`
//!   ([`KernelSymbolTable`])
//! - a live, potentially containerized, user space process
//!   ([`ProcessSymbolResolver`])
//! - a binary identified solely by its GNU build ID
//!   ([`BuildIdSymbolResolver`])
//!
//! All resolvers are caches: symbol tables are loaded on first use and
//! kept until explicitly refreshed. The [`Symbolizer`] type bundles all
//! of them behind a single interface.
//!
//! ```no_run
//! use symcache::Context;
//! use symcache::Pid;
//! use symcache::Symbolizer;
//!
//! let mut symbolizer = Symbolizer::new();
//! let addr = 0xffffffff81000000;
//! match symbolizer.resolve_addr(Context::Kernel, addr).unwrap() {
//!     Ok(sym) => println!("{addr:#x}: {}+{:#x}", sym.name, sym.offset),
//!     Err(reason) => println!("{addr:#x}: <{reason}>"),
//! }
//!
//! let _result = symbolizer.resolve_name(Context::Process(Pid::Slf), None, "main");
//! ```

#![allow(clippy::collapsible_if, clippy::let_and_return, clippy::let_unit_value)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod build_id;
mod demangle;
mod elf;
mod error;
mod kernel;
mod maps;
mod mmap;
mod namespace;
mod pid;
mod process;
mod symbolizer;
mod symtab;
#[cfg(any(test, feature = "test"))]
mod test_helper;
mod util;

use std::borrow::Cow;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::PathBuf;

pub use crate::build_id::BuildIdBinary;
pub use crate::build_id::BuildIdLocator;
pub use crate::build_id::BuildIdSymbolResolver;
pub use crate::build_id::DebugDirLocator;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::IntoCowStr;
pub use crate::kernel::KernelSymbolTable;
pub use crate::kernel::KALLSYMS;
pub use crate::pid::Pid;
pub use crate::process::MapRange;
pub use crate::process::ModuleInfo;
pub use crate::process::ModulePathResolver;
pub use crate::process::ModuleType;
pub use crate::process::ProcessRootTracker;
pub use crate::process::ProcessSymbolResolver;
pub use crate::symbolizer::Builder;
pub use crate::symbolizer::Context;
pub use crate::symbolizer::Symbolizer;

pub(crate) use crate::error::IntoError;


/// A type representing addresses.
pub type Addr = u64;


/// A result type using our [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;


/// The directories searched for separate debug files by default.
pub const DEFAULT_DEBUG_DIRS: &[&str] = &["/usr/lib/debug", "/lib/debug"];


/// The type of a symbol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SymType {
    /// The symbol type is unspecified or unknown.
    ///
    /// In input contexts this variant can be used to encompass all
    /// other variants (functions and variables), whereas in output
    /// contexts it means that the type is not known.
    #[default]
    Undefined,
    /// The symbol is a function.
    Function,
    /// The symbol is a variable.
    Variable,
}


/// The reason why a lookup did not produce a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Reason {
    /// The address is not covered by any module of the address space
    /// in question.
    Unmapped,
    /// The module covering the address, or the table as a whole, does
    /// not contain any symbols. This is also reported after a failed
    /// attempt at loading them.
    MissingSyms,
    /// Symbols are available, but none of them covers the address.
    UnknownAddr,
    /// No symbol of the given name exists.
    UnknownName,
    /// The module referenced by name is not known.
    UnknownModule,
    /// The build ID has not been registered.
    UnknownBuildId,
}

impl Reason {
    /// Retrieve a textual representation of the reason.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmapped => "absolute address not found in virtual memory map of process",
            Self::MissingSyms => "symbolization source has no or no relevant symbols",
            Self::UnknownAddr => "address not found in symbolization source",
            Self::UnknownName => "symbol name not found in symbolization source",
            Self::UnknownModule => "module not found in address space",
            Self::UnknownBuildId => "build ID is not registered",
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}


/// A symbol as reported by one of the resolvers.
///
/// Names and module names are borrowed from the resolver they originate
/// from, unless demangling produced a new string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sym<'src> {
    /// The symbol name.
    pub name: Cow<'src, str>,
    /// The name of the module (binary, shared object, perf map, or
    /// kernel module) containing the symbol, if any.
    pub module: Option<&'src str>,
    /// The symbol's start address, in the address space of the
    /// resolver.
    pub addr: Addr,
    /// The symbol's size, if known.
    pub size: Option<usize>,
    /// The offset of the looked up address from the start of the
    /// symbol.
    pub offset: usize,
}


/// Options controlling how symbols are read from binaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolOptions {
    /// Whether to consult a separate debug file, located by build ID
    /// or `.gnu_debuglink`, for binaries without a `.symtab` section.
    pub debug_file: bool,
    /// Whether a debug file found via `.gnu_debuglink` has to match
    /// the recorded CRC32 checksum.
    pub check_debug_file_crc: bool,
    /// Whether to defer reading of symbol names until they are first
    /// requested.
    pub lazy: bool,
    /// The type of symbols to load.
    pub sym_type: SymType,
    /// Whether a process resolver should rescan the memory map before
    /// a lookup if the process' root or executable changed.
    pub auto_refresh: bool,
    /// Directories to search for separate debug files.
    pub debug_dirs: Vec<PathBuf>,
}

impl Default for SymbolOptions {
    fn default() -> Self {
        Self {
            debug_file: true,
            check_debug_file_crc: true,
            lazy: true,
            sym_type: SymType::Function,
            auto_refresh: true,
            debug_dirs: DEFAULT_DEBUG_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}


/// The capabilities shared by all resolvers.
///
/// Implemented by [`KernelSymbolTable`], [`ProcessSymbolResolver`], and
/// by each binary of a [`BuildIdSymbolResolver`], [`BuildIdBinary`].
pub trait SymbolCache {
    /// Discard cached state and re-read it from the underlying source.
    fn refresh(&mut self) -> Result<()>;

    /// Find the symbol covering the given address.
    fn resolve_addr(&mut self, addr: Addr, demangle: bool) -> Result<Sym<'_>, Reason>;

    /// Find the address of the symbol with the given name, optionally
    /// restricting the search to a single module.
    fn resolve_name(&mut self, module: Option<&str>, name: &str) -> Result<Addr, Reason>;
}


#[cfg(feature = "tracing")]
#[macro_use]
#[allow(unused_imports)]
mod log {
    pub(crate) use tracing::debug;
    pub(crate) use tracing::error;
    pub(crate) use tracing::info;
    pub(crate) use tracing::instrument;
    pub(crate) use tracing::trace;
    pub(crate) use tracing::warn;
}

#[cfg(not(feature = "tracing"))]
#[macro_use]
#[allow(unused_imports)]
mod log {
    macro_rules! debug {
        ($($args:tt)*) => {{
          if false {
            // Make sure to use `args` to prevent any warnings about
            // unused variables.
            let _args = format_args!($($args)*);
          }
        }};
    }
    pub(crate) use debug;
    pub(crate) use debug as error;
    pub(crate) use debug as info;
    pub(crate) use debug as trace;
    pub(crate) use debug as warn;
}


/// Functionality only useful for testing and benchmarking, not meant
/// for general consumption.
#[cfg(feature = "test")]
#[doc(hidden)]
pub mod __private {
    pub use crate::test_helper::ElfBuilder;
    pub use crate::test_helper::SymSpec;
    pub use crate::util::stat_ino;
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_tag::tag;


    /// Exercise the `Debug` representation of various types.
    #[tag(miri)]
    #[test]
    fn debug_repr() {
        let sym = Sym {
            name: Cow::Borrowed("foo"),
            module: Some("/usr/bin/foo"),
            addr: 0x1000,
            size: Some(0x50),
            offset: 0x10,
        };
        assert_ne!(format!("{sym:?}"), "");
        assert_ne!(format!("{:?}", SymbolOptions::default()), "");
        assert_ne!(format!("{:?}", SymType::default()), "");
    }

    /// Check that every `Reason` has a distinct textual
    /// representation.
    #[tag(miri)]
    #[test]
    fn reason_display() {
        let reasons = [
            Reason::Unmapped,
            Reason::MissingSyms,
            Reason::UnknownAddr,
            Reason::UnknownName,
            Reason::UnknownModule,
            Reason::UnknownBuildId,
        ];
        for (i, reason) in reasons.iter().enumerate() {
            assert_eq!(reason.to_string(), reason.as_str());
            for other in &reasons[i + 1..] {
                assert_ne!(reason.as_str(), other.as_str());
            }
        }
    }

    /// Make sure that the default options match the documented
    /// defaults.
    #[tag(miri)]
    #[test]
    fn default_options() {
        let opts = SymbolOptions::default();
        assert!(opts.debug_file);
        assert!(opts.check_debug_file_crc);
        assert!(opts.lazy);
        assert!(opts.auto_refresh);
        assert_eq!(opts.sym_type, SymType::Function);
        assert_eq!(
            opts.debug_dirs,
            vec![PathBuf::from("/usr/lib/debug"), PathBuf::from("/lib/debug")]
        );
    }
}
