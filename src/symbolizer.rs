use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::Path;
use std::path::PathBuf;

use crate::build_id::BuildIdLocator;
use crate::build_id::BuildIdSymbolResolver;
use crate::build_id::DebugDirLocator;
use crate::kernel::KernelSymbolTable;
use crate::kernel::KALLSYMS;
use crate::log::debug;
use crate::process::ProcessSymbolResolver;
use crate::Addr;
use crate::Error;
use crate::Pid;
use crate::Reason;
use crate::Result;
use crate::Sym;
use crate::SymbolCache;
use crate::SymbolOptions;
use crate::DEFAULT_DEBUG_DIRS;


/// The address space a lookup is performed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Context<'build_id> {
    /// The running kernel.
    Kernel,
    /// The process with the given ID.
    Process(Pid),
    /// The binary with the given hex encoded build ID, which has to be
    /// registered beforehand.
    BuildId(&'build_id str),
}


/// A builder for configurable construction of [`Symbolizer`] objects.
///
/// By default demangling is enabled, symbol names are read lazily, and
/// separate debug files are consulted for stripped binaries.
pub struct Builder {
    /// See [`Builder::enable_demangling`].
    demangle: bool,
    /// See [`Builder::enable_debug_file`].
    debug_file: bool,
    /// See [`Builder::enable_lazy_symbols`].
    lazy: bool,
    /// See [`Builder::set_debug_dirs`].
    debug_dirs: Vec<PathBuf>,
    /// See [`Builder::set_kallsyms`].
    kallsyms: PathBuf,
    /// See [`Builder::set_build_id_locator`].
    locator: Option<Box<dyn BuildIdLocator>>,
}

impl Builder {
    /// Enable/disable the demangling of symbol names.
    pub fn enable_demangling(mut self, enable: bool) -> Builder {
        self.demangle = enable;
        self
    }

    /// Enable/disable the usage of separate debug files for binaries
    /// lacking a `.symtab` section.
    pub fn enable_debug_file(mut self, enable: bool) -> Builder {
        self.debug_file = enable;
        self
    }

    /// Enable/disable deferred reading of symbol names.
    ///
    /// Lazily read names keep memory consumption down for large
    /// binaries, at the cost of re-opening the binary the first time a
    /// name is needed.
    pub fn enable_lazy_symbols(mut self, enable: bool) -> Builder {
        self.lazy = enable;
        self
    }

    /// Set the directories to search for separate debug files.
    ///
    /// Unless a locator was set explicitly, binaries identified by
    /// build ID are searched for in these directories as well.
    pub fn set_debug_dirs<D, P>(mut self, dirs: D) -> Builder
    where
        D: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.debug_dirs = dirs
            .into_iter()
            .map(|dir| dir.as_ref().to_path_buf())
            .collect();
        self
    }

    /// Set the path of the kallsyms file to read kernel symbols from.
    pub fn set_kallsyms<P>(mut self, path: P) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.kallsyms = path.into();
        self
    }

    /// Set the locator used for finding binaries by build ID.
    pub fn set_build_id_locator<L>(mut self, locator: L) -> Builder
    where
        L: BuildIdLocator + 'static,
    {
        self.locator = Some(Box::new(locator));
        self
    }

    /// Create the [`Symbolizer`] object.
    pub fn build(self) -> Symbolizer {
        let Builder {
            demangle,
            debug_file,
            lazy,
            debug_dirs,
            kallsyms,
            locator,
        } = self;

        let options = SymbolOptions {
            debug_file,
            lazy,
            debug_dirs: debug_dirs.clone(),
            ..Default::default()
        };
        let locator = locator.unwrap_or_else(|| Box::new(DebugDirLocator::new(debug_dirs)));

        Symbolizer {
            demangle,
            kernel: KernelSymbolTable::with_path(kallsyms),
            processes: HashMap::new(),
            build_ids: BuildIdSymbolResolver::with_boxed_locator(locator, options.clone()),
            options,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            demangle: true,
            debug_file: true,
            lazy: true,
            debug_dirs: DEFAULT_DEBUG_DIRS.iter().map(PathBuf::from).collect(),
            kallsyms: PathBuf::from(KALLSYMS),
            locator: None,
        }
    }
}

impl Debug for Builder {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Builder")
            .field("demangle", &self.demangle)
            .field("debug_file", &self.debug_file)
            .field("lazy", &self.lazy)
            .field("debug_dirs", &self.debug_dirs)
            .field("kallsyms", &self.kallsyms)
            .field("custom_locator", &self.locator.is_some())
            .finish()
    }
}


/// A symbolizer for addresses in the kernel, in processes, and in
/// binaries identified by build ID.
///
/// The symbolizer owns one resolver per address space. Process
/// resolvers are created on first use of the respective process ID and
/// kept until [`Symbolizer::forget_process`] is called.
#[derive(Debug)]
pub struct Symbolizer {
    demangle: bool,
    options: SymbolOptions,
    kernel: KernelSymbolTable,
    processes: HashMap<Pid, ProcessSymbolResolver>,
    build_ids: BuildIdSymbolResolver,
}

impl Symbolizer {
    /// Create a new [`Symbolizer`] with the default configuration.
    pub fn new() -> Self {
        Builder::default().build()
    }

    /// Retrieve a [`Builder`] object for configurable construction of a
    /// [`Symbolizer`].
    pub fn builder() -> Builder {
        Builder::default()
    }

    fn process(&mut self, pid: Pid) -> Result<&mut ProcessSymbolResolver> {
        match self.processes.entry(pid) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!("creating resolver for process {pid}");
                let resolver = ProcessSymbolResolver::new(pid, self.options.clone())?;
                Ok(entry.insert(resolver))
            }
        }
    }

    /// Retrieve the cache responsible for the given context, creating
    /// it if necessary.
    fn cache(&mut self, ctx: Context<'_>) -> Result<Result<&mut dyn SymbolCache, Reason>> {
        let cache = match ctx {
            Context::Kernel => Ok(&mut self.kernel as &mut dyn SymbolCache),
            Context::Process(pid) => Ok(self.process(pid)? as &mut dyn SymbolCache),
            Context::BuildId(build_id) => self
                .build_ids
                .binary(build_id)
                .map(|binary| binary as &mut dyn SymbolCache),
        };
        Ok(cache)
    }

    /// Find the symbol covering `addr` in the given context.
    ///
    /// The outer `Result` reports failures to set up the context, the
    /// inner one the outcome of the lookup.
    pub fn resolve_addr(&mut self, ctx: Context<'_>, addr: Addr) -> Result<Result<Sym<'_>, Reason>> {
        let demangle = self.demangle;
        let result = self
            .cache(ctx)?
            .and_then(|cache| cache.resolve_addr(addr, demangle));
        Ok(result)
    }

    /// Find the address of the symbol with the given name in the given
    /// context.
    ///
    /// `module` restricts the search to a single module of a process.
    /// It is ignored in other contexts.
    pub fn resolve_name(
        &mut self,
        ctx: Context<'_>,
        module: Option<&str>,
        name: &str,
    ) -> Result<Result<Addr, Reason>> {
        let result = self
            .cache(ctx)?
            .and_then(|cache| cache.resolve_name(module, name));
        Ok(result)
    }

    /// Discard cached data of the given context and read it anew.
    ///
    /// Refreshing a process that has not been used before merely
    /// creates its resolver. Binaries have to be registered for their
    /// build ID to be refreshed.
    pub fn refresh(&mut self, ctx: Context<'_>) -> Result<()> {
        if let Context::Process(pid) = ctx {
            if !self.processes.contains_key(&pid) {
                // A newly created resolver is current.
                return self.process(pid).map(|_resolver| ())
            }
        }

        match self.cache(ctx)? {
            Ok(cache) => cache.refresh(),
            Err(reason) => Err(Error::with_not_found(format!(
                "failed to refresh symbols of {ctx:?}: {reason}"
            ))),
        }
    }

    /// Drop all cached data of process `pid`.
    ///
    /// Returns whether data had been cached.
    pub fn forget_process(&mut self, pid: Pid) -> bool {
        self.processes.remove(&pid).is_some()
    }

    /// Register the binary with the given build ID, as found by the
    /// configured [`BuildIdLocator`].
    pub fn add_build_id(&mut self, build_id: &str) -> bool {
        self.build_ids.add_module(build_id)
    }

    /// Register the binary at `path` under the build ID it carries,
    /// returning said build ID.
    pub fn add_build_id_file(&mut self, path: &Path) -> Result<String> {
        self.build_ids.add_file(path)
    }
}

impl Default for Symbolizer {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;
    use test_log::test;
    use test_tag::tag;

    use crate::elf::types::ET_DYN;
    use crate::test_helper::ElfBuilder;
    use crate::test_helper::SymSpec;


    /// Exercise the `Debug` representation of various types.
    #[tag(miri)]
    #[test]
    fn debug_repr() {
        let builder = Symbolizer::builder().set_build_id_locator(|_: &str| -> Option<PathBuf> { None });
        assert_ne!(format!("{builder:?}"), "");
        let symbolizer = builder.build();
        assert_ne!(format!("{symbolizer:?}"), "");
        assert_ne!(format!("{:?}", Context::BuildId("abcd")), "");
    }

    /// Check that builder settings are honored.
    #[tag(miri)]
    #[test]
    fn builder_configuration() {
        let symbolizer = Symbolizer::builder()
            .enable_demangling(false)
            .enable_debug_file(false)
            .enable_lazy_symbols(false)
            .set_debug_dirs(["/tmp/debug"])
            .set_kallsyms("/tmp/kallsyms")
            .build();
        assert!(!symbolizer.demangle);
        assert!(!symbolizer.options.debug_file);
        assert!(!symbolizer.options.lazy);
        assert_eq!(symbolizer.options.debug_dirs, vec![PathBuf::from("/tmp/debug")]);
        assert_eq!(symbolizer.kernel.path(), Path::new("/tmp/kallsyms"));

        let symbolizer = Symbolizer::default();
        assert!(symbolizer.demangle);
        assert_eq!(symbolizer.options, SymbolOptions::default());
        assert_eq!(symbolizer.kernel.path(), Path::new(KALLSYMS));
    }

    /// Check that lookups are dispatched to the resolver of the
    /// respective context.
    #[test]
    fn context_dispatch() {
        let dir = tempdir().unwrap();
        let kallsyms = dir.path().join("kallsyms");
        let () = fs::write(
            &kallsyms,
            b"ffffffff81000000 T _stext\nffffffff81000100 t other_fn\n",
        )
        .unwrap();
        let binary = dir.path().join("libfoo.so");
        let elf = ElfBuilder::new(ET_DYN)
            .build_id(&[0x01, 0x02, 0x03, 0x04])
            .symbol(SymSpec::func("foo", 0x1000, 0x10))
            .build();
        let () = fs::write(&binary, elf).unwrap();

        let locator_path = binary.clone();
        let mut symbolizer = Symbolizer::builder()
            .set_kallsyms(&kallsyms)
            .set_build_id_locator(move |build_id: &str| {
                (build_id == "01020304").then(|| locator_path.clone())
            })
            .build();

        let sym = symbolizer
            .resolve_addr(Context::Kernel, 0xffffffff81000104)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, "other_fn");
        assert_eq!(sym.offset, 4);
        assert_eq!(
            symbolizer
                .resolve_name(Context::Kernel, None, "_stext")
                .unwrap(),
            Ok(0xffffffff81000000)
        );

        assert_eq!(
            symbolizer
                .resolve_addr(Context::BuildId("01020304"), 0x1004)
                .unwrap(),
            Err(Reason::UnknownBuildId)
        );
        assert!(symbolizer.add_build_id("01020304"));
        assert!(!symbolizer.add_build_id("05060708"));
        let sym = symbolizer
            .resolve_addr(Context::BuildId("01020304"), 0x1004)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, "foo");
        assert_eq!(
            symbolizer
                .resolve_name(Context::BuildId("01020304"), None, "foo")
                .unwrap(),
            Ok(0x1000)
        );
        let () = symbolizer.refresh(Context::BuildId("01020304")).unwrap();
        assert!(symbolizer.refresh(Context::BuildId("05060708")).is_err());
        assert_eq!(
            symbolizer.add_build_id_file(&binary).unwrap(),
            "01020304"
        );

        let () = symbolizer.refresh(Context::Kernel).unwrap();
        let () = fs::remove_file(&kallsyms).unwrap();
        assert!(symbolizer.refresh(Context::Kernel).is_err());
    }

    /// Check that process resolvers are created on demand and can be
    /// dropped.
    #[test]
    fn process_lifecycle() {
        let mut symbolizer = Symbolizer::new();
        assert!(!symbolizer.forget_process(Pid::Slf));

        let result = symbolizer
            .resolve_addr(Context::Process(Pid::Slf), 0x10)
            .unwrap();
        assert!(result.is_err());
        let () = symbolizer.refresh(Context::Process(Pid::Slf)).unwrap();
        assert!(symbolizer.forget_process(Pid::Slf));
        assert!(!symbolizer.forget_process(Pid::Slf));

        let () = symbolizer.refresh(Context::Process(Pid::Slf)).unwrap();
        assert!(symbolizer.forget_process(Pid::Slf));

        // A process that does not exist cannot be symbolized.
        let result = symbolizer.resolve_addr(Context::Process(Pid::from(u32::MAX)), 0x10);
        assert!(result.is_err());
        assert!(!symbolizer.forget_process(Pid::from(u32::MAX)));
    }
}
