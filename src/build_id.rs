//! Symbolization of addresses in binaries identified by their GNU
//! build ID.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::Path;
use std::path::PathBuf;

use crate::demangle::maybe_demangle;
use crate::elf::build_id_path;
use crate::elf::read_build_id;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::warn;
use crate::symtab::read_elf_symbols;
use crate::symtab::LazyParsers;
use crate::symtab::SymbolTable;
use crate::util::bytes_to_hex;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Reason;
use crate::Result;
use crate::Sym;
use crate::SymType;
use crate::SymbolCache;
use crate::SymbolOptions;
use crate::DEFAULT_DEBUG_DIRS;


/// A type mapping build IDs to the binaries carrying them.
pub trait BuildIdLocator {
    /// Find the binary with the given build ID, a lowercase hex
    /// string.
    fn locate(&self, build_id: &str) -> Option<PathBuf>;
}

impl<F> BuildIdLocator for F
where
    F: Fn(&str) -> Option<PathBuf>,
{
    fn locate(&self, build_id: &str) -> Option<PathBuf> {
        self(build_id)
    }
}


/// A [`BuildIdLocator`] searching the `.build-id` hierarchy of debug
/// directories.
///
/// For each directory `<dir>`, the files
/// `<dir>/.build-id/<xx>/<rest>.debug` and `<dir>/.build-id/<xx>/<rest>`
/// are checked, where `<xx>` are the first two characters of the build
/// ID and `<rest>` the remaining ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugDirLocator {
    dirs: Vec<PathBuf>,
}

impl DebugDirLocator {
    /// Create a locator searching the provided directories.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl Default for DebugDirLocator {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUG_DIRS.iter().map(PathBuf::from).collect())
    }
}

impl BuildIdLocator for DebugDirLocator {
    fn locate(&self, build_id: &str) -> Option<PathBuf> {
        self.dirs.iter().find_map(|dir| {
            [true, false]
                .into_iter()
                .filter_map(|debug_suffix| build_id_path(dir, build_id, debug_suffix))
                .find(|path| path.is_file())
        })
    }
}


/// Normalize a hex encoded build ID to lowercase, checking its
/// validity.
fn normalize_build_id(build_id: &str) -> Option<String> {
    let valid = !build_id.is_empty()
        && build_id.len() % 2 == 0
        && build_id.bytes().all(|b| b.is_ascii_hexdigit());
    valid.then(|| build_id.to_ascii_lowercase())
}


/// The symbols of a single binary registered with a
/// [`BuildIdSymbolResolver`].
///
/// Offsets are interpreted in the address space the binary's symbols
/// are expressed in. Module names passed to
/// [`SymbolCache::resolve_name`] are ignored.
#[derive(Debug)]
pub struct BuildIdBinary {
    path: PathBuf,
    /// The path in textual form, as reported in symbols.
    name: String,
    options: SymbolOptions,
    loaded: bool,
    symbols: SymbolTable,
}

impl BuildIdBinary {
    fn new(path: PathBuf, options: &SymbolOptions) -> Self {
        Self {
            name: path.to_string_lossy().into_owned(),
            path,
            options: SymbolOptions {
                lazy: false,
                sym_type: SymType::Function,
                ..options.clone()
            },
            loaded: false,
            symbols: SymbolTable::default(),
        }
    }

    /// Retrieve the path to the binary.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_symbols(&mut self) -> Result<()> {
        let parser = ElfParser::open(&self.path)?;
        let symbols = read_elf_symbols(&parser, &self.path, &self.options)?;
        debug!("loaded {} symbols of `{}`", symbols.syms.len(), self.name);
        self.symbols = SymbolTable::new(symbols.syms);
        Ok(())
    }

    fn load(&mut self) {
        if !self.loaded {
            self.loaded = true;
            if let Err(err) = self.read_symbols() {
                warn!("failed to load symbols of `{}`: {err:#}", self.name);
            }
        }
    }

    fn clear(&mut self) {
        self.loaded = false;
        self.symbols = SymbolTable::default();
    }
}

impl SymbolCache for BuildIdBinary {
    fn refresh(&mut self) -> Result<()> {
        let () = self.clear();
        self.loaded = true;
        self.read_symbols()
    }

    fn resolve_addr(&mut self, offset: Addr, demangle: bool) -> Result<Sym<'_>, Reason> {
        let () = self.load();

        let idx = self.symbols.find_addr(offset)?;
        let sym = self.symbols.get(idx).ok_or(Reason::UnknownAddr)?;
        let name = sym.name.as_str().ok_or(Reason::MissingSyms)?;
        let sym = Sym {
            name: maybe_demangle(name, demangle),
            module: Some(&self.name),
            addr: sym.start,
            size: Some(sym.size as usize),
            offset: (offset - sym.start) as usize,
        };
        Ok(sym)
    }

    fn resolve_name(&mut self, _module: Option<&str>, name: &str) -> Result<Addr, Reason> {
        let () = self.load();

        // Names are read eagerly, so there is nothing to read lazily.
        let mut parsers = LazyParsers::new(&self.path, None);
        match self.symbols.find_name(name, &mut parsers) {
            Ok(Some(sym)) => Ok(sym.start),
            Ok(None) => Err(Reason::UnknownName),
            Err(err) => {
                warn!("failed to index symbol names of `{}`: {err:#}", self.name);
                Err(Reason::MissingSyms)
            }
        }
    }
}


/// A resolver of symbols in binaries identified by build ID.
///
/// Binaries have to be registered before addresses in them can be
/// resolved, either by build ID, in which case a [`BuildIdLocator`]
/// finds the binary, or directly by path. Symbols are loaded on first
/// use. Each registered binary is a [`BuildIdBinary`], which can be
/// accessed via [`BuildIdSymbolResolver::binary`].
pub struct BuildIdSymbolResolver {
    locator: Box<dyn BuildIdLocator>,
    /// Registered modules, keyed by lowercase hex build ID.
    modules: HashMap<String, BuildIdBinary>,
    options: SymbolOptions,
}

impl BuildIdSymbolResolver {
    /// Create a resolver locating binaries in the default debug
    /// directories.
    pub fn new() -> Self {
        Self::with_locator(DebugDirLocator::default(), SymbolOptions::default())
    }

    /// Create a resolver using the provided locator and options.
    pub fn with_locator<L>(locator: L, options: SymbolOptions) -> Self
    where
        L: BuildIdLocator + 'static,
    {
        Self::with_boxed_locator(Box::new(locator), options)
    }

    pub(crate) fn with_boxed_locator(locator: Box<dyn BuildIdLocator>, options: SymbolOptions) -> Self {
        Self {
            locator,
            modules: HashMap::new(),
            options,
        }
    }

    /// Retrieve the number of registered binaries.
    #[inline]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check whether no binaries are registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Check whether a binary with the given build ID is registered.
    pub fn contains(&self, build_id: &str) -> bool {
        normalize_build_id(build_id)
            .map(|build_id| self.modules.contains_key(&build_id))
            .unwrap_or(false)
    }

    /// Register the binary with the given hex encoded build ID.
    ///
    /// Returns `false` if the build ID is malformed or no binary with
    /// it could be located. Registering a build ID again keeps the
    /// already registered binary.
    pub fn add_module(&mut self, build_id: &str) -> bool {
        let build_id = match normalize_build_id(build_id) {
            Some(build_id) => build_id,
            None => {
                debug!("ignoring malformed build ID `{build_id}`");
                return false
            }
        };

        if self.modules.contains_key(&build_id) {
            return true
        }

        match self.locator.locate(&build_id) {
            Some(path) => {
                debug!("found binary `{}` for build ID {build_id}", path.display());
                let binary = BuildIdBinary::new(path, &self.options);
                let _module = self.modules.insert(build_id, binary);
                true
            }
            None => {
                debug!("failed to locate binary for build ID {build_id}");
                false
            }
        }
    }

    /// Register the binary at `path` under the build ID it carries,
    /// returning said build ID.
    pub fn add_file(&mut self, path: &Path) -> Result<String> {
        let parser = ElfParser::open(path)?;
        let build_id = read_build_id(&parser)
            .with_context(|| format!("failed to read build ID of `{}`", path.display()))?
            .ok_or_else(|| {
                Error::with_not_found(format!("`{}` does not carry a build ID", path.display()))
            })?;
        if build_id.is_empty() {
            return Err(Error::with_invalid_data(format!(
                "`{}` carries an empty build ID",
                path.display()
            )))
        }
        let build_id = bytes_to_hex(&build_id);

        let options = &self.options;
        let _module = self
            .modules
            .entry(build_id.clone())
            .or_insert_with(|| BuildIdBinary::new(path.to_path_buf(), options));
        Ok(build_id)
    }

    /// Retrieve the registered binary with the given build ID.
    ///
    /// Symbols are not loaded by this method.
    pub fn binary(&mut self, build_id: &str) -> Result<&mut BuildIdBinary, Reason> {
        let build_id = normalize_build_id(build_id).ok_or(Reason::UnknownBuildId)?;
        self.modules
            .get_mut(&build_id)
            .ok_or(Reason::UnknownBuildId)
    }

    /// Find the symbol covering `offset` inside the binary with the
    /// given build ID.
    ///
    /// `offset` is interpreted in the address space the binary's
    /// symbols are expressed in.
    pub fn resolve_addr(
        &mut self,
        build_id: &str,
        offset: u64,
        demangle: bool,
    ) -> Result<Sym<'_>, Reason> {
        self.binary(build_id)?.resolve_addr(offset, demangle)
    }

    /// Find the address of the symbol with the given name inside the
    /// binary with the given build ID.
    pub fn resolve_name(&mut self, build_id: &str, name: &str) -> Result<Addr, Reason> {
        self.binary(build_id)?.resolve_name(None, name)
    }

    /// Discard all loaded symbol tables, keeping registrations.
    ///
    /// Tables are reloaded on next use.
    pub fn refresh(&mut self) {
        for binary in self.modules.values_mut() {
            let () = binary.clear();
        }
    }
}

impl Default for BuildIdSymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for BuildIdSymbolResolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("BuildIdSymbolResolver")
            .field("modules", &self.modules)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;
    use tempfile::TempDir;
    use test_log::test;
    use test_tag::tag;

    use crate::elf::types::ET_DYN;
    use crate::test_helper::ElfBuilder;
    use crate::ErrorKind;
    use crate::test_helper::SymSpec;


    /// Create a debug directory containing two binaries with distinct
    /// build IDs.
    fn debug_dir() -> TempDir {
        let dir = tempdir().unwrap();
        let build_id_dir = dir.path().join(".build-id").join("aa");
        let () = fs::create_dir_all(&build_id_dir).unwrap();

        let elf = ElfBuilder::new(ET_DYN)
            .build_id(&[0xaa, 0x01, 0x02])
            .symbol(SymSpec::func("first_fn", 0x1000, 0x40))
            .build();
        let () = fs::write(build_id_dir.join("0102.debug"), elf).unwrap();

        let elf = ElfBuilder::new(ET_DYN)
            .build_id(&[0xaa, 0x03, 0x04])
            .symbol(SymSpec::func("second_fn", 0x1000, 0x40))
            .symbol(SymSpec::object("second_var", 0x2000, 0x8))
            .build();
        let () = fs::write(build_id_dir.join("0304"), elf).unwrap();
        dir
    }


    /// Check that we validate and normalize build IDs.
    #[tag(miri)]
    #[test]
    fn build_id_normalization() {
        assert_eq!(normalize_build_id("AbCd01"), Some("abcd01".to_string()));
        assert_eq!(normalize_build_id(""), None);
        assert_eq!(normalize_build_id("abc"), None);
        assert_eq!(normalize_build_id("zz"), None);
        assert_eq!(normalize_build_id("../.."), None);
    }

    /// Check that the locator finds binaries with and without `.debug`
    /// suffix.
    #[test]
    fn debug_dir_location() {
        let dir = debug_dir();
        let locator = DebugDirLocator::new(vec![
            PathBuf::from("/does-not-exist"),
            dir.path().to_path_buf(),
        ]);
        assert_eq!(
            locator.locate("aa0102"),
            Some(dir.path().join(".build-id/aa/0102.debug"))
        );
        assert_eq!(
            locator.locate("aa0304"),
            Some(dir.path().join(".build-id/aa/0304"))
        );
        assert_eq!(locator.locate("aa0506"), None);
        assert_ne!(DebugDirLocator::default(), locator);
    }

    /// Check that binaries with different build IDs are kept apart.
    #[test]
    fn build_id_isolation() {
        let dir = debug_dir();
        let locator = DebugDirLocator::new(vec![dir.path().to_path_buf()]);
        let mut resolver = BuildIdSymbolResolver::with_locator(locator, SymbolOptions::default());
        assert_ne!(format!("{resolver:?}"), "");
        assert!(resolver.is_empty());

        assert!(resolver.add_module("AA0102"));
        assert!(resolver.add_module("aa0304"));
        assert!(resolver.add_module("aa0304"));
        assert!(!resolver.add_module("aa0506"));
        assert!(!resolver.add_module("not-hex"));
        assert_eq!(resolver.len(), 2);

        let sym = resolver.resolve_addr("aa0102", 0x1010, false).unwrap();
        assert_eq!(sym.name, "first_fn");
        assert_eq!(sym.offset, 0x10);
        assert!(sym.module.unwrap().ends_with("0102.debug"));

        let sym = resolver.resolve_addr("aa0304", 0x1010, false).unwrap();
        assert_eq!(sym.name, "second_fn");
        assert!(sym.module.unwrap().ends_with("0304"));

        // Only functions are considered.
        assert_eq!(
            resolver.resolve_addr("aa0304", 0x2000, false),
            Err(Reason::UnknownAddr)
        );
        assert_eq!(resolver.resolve_name("aa0102", "second_fn"), Err(Reason::UnknownName));
        assert_eq!(resolver.resolve_name("aa0304", "second_fn"), Ok(0x1000));

        // Lookups of unknown build IDs have no effect.
        assert_eq!(
            resolver.resolve_addr("aa0506", 0x1010, false),
            Err(Reason::UnknownBuildId)
        );
        assert_eq!(
            resolver.resolve_name("aa0506", "first_fn"),
            Err(Reason::UnknownBuildId)
        );
        assert_eq!(resolver.len(), 2);
        assert!(!resolver.contains("aa0506"));
        assert!(resolver.contains("AA0102"));
    }

    /// Check that binaries can be registered by path and that a refresh
    /// reloads symbols.
    #[test]
    fn file_registration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("libfoo.so");
        let elf = ElfBuilder::new(ET_DYN)
            .build_id(&[0xde, 0xad, 0xbe, 0xef])
            .symbol(SymSpec::func("foo", 0x1000, 0x10))
            .build();
        let () = fs::write(&path, elf).unwrap();

        let locator = |_: &str| -> Option<PathBuf> { None };
        let mut resolver = BuildIdSymbolResolver::with_locator(locator, SymbolOptions::default());
        let build_id = resolver.add_file(&path).unwrap();
        assert_eq!(build_id, "deadbeef");
        assert_eq!(resolver.resolve_name("DEADBEEF", "foo"), Ok(0x1000));

        let elf = ElfBuilder::new(ET_DYN)
            .build_id(&[0xde, 0xad, 0xbe, 0xef])
            .symbol(SymSpec::func("bar", 0x1000, 0x10))
            .build();
        let () = fs::write(&path, elf).unwrap();
        // Symbols stay cached until refreshed.
        assert_eq!(resolver.resolve_name("deadbeef", "bar"), Err(Reason::UnknownName));
        let () = resolver.refresh();
        assert_eq!(resolver.resolve_name("deadbeef", "bar"), Ok(0x1000));
        assert_eq!(resolver.len(), 1);

        let path = dir.path().join("no-build-id");
        let () = fs::write(&path, ElfBuilder::new(ET_DYN).build()).unwrap();
        let err = resolver.add_file(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // An empty build ID could never be looked up.
        let path = dir.path().join("empty-build-id");
        let () = fs::write(&path, ElfBuilder::new(ET_DYN).build_id(&[]).build()).unwrap();
        let err = resolver.add_file(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(resolver.len(), 1);
        assert!(!resolver.contains(""));
    }

    /// Check that registered binaries can be used via the generic
    /// cache interface.
    #[test]
    fn binary_symbol_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("libbaz.so");
        let elf = ElfBuilder::new(ET_DYN)
            .build_id(&[0x12, 0x34])
            .symbol(SymSpec::func("baz", 0x3000, 0x20))
            .build();
        let () = fs::write(&path, elf).unwrap();

        let locator = DebugDirLocator::new(Vec::new());
        let mut resolver = BuildIdSymbolResolver::with_locator(locator, SymbolOptions::default());
        assert_eq!(resolver.add_file(&path).unwrap(), "1234");
        assert_eq!(resolver.binary("5678").unwrap_err(), Reason::UnknownBuildId);

        fn lookup<C>(cache: &mut C) -> (String, Addr)
        where
            C: SymbolCache + ?Sized,
        {
            let addr = cache.resolve_name(Some("ignored"), "baz").unwrap();
            let sym = cache.resolve_addr(addr + 8, false).unwrap();
            assert_eq!(sym.offset, 8);
            (sym.name.into_owned(), addr)
        }

        let binary = resolver.binary("1234").unwrap();
        assert_eq!(binary.path(), path);
        assert_eq!(lookup(&mut *binary), ("baz".to_string(), 0x3000));
        assert_eq!(binary.resolve_addr(0x3020, false), Err(Reason::UnknownAddr));
        let () = binary.refresh().unwrap();

        let () = fs::remove_file(&path).unwrap();
        let binary = resolver.binary("1234").unwrap();
        assert!(binary.refresh().is_err());
        assert_eq!(binary.resolve_name(None, "baz"), Err(Reason::UnknownName));
    }
}
