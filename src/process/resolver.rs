use std::mem::take;

use crate::log::debug;
use crate::log::warn;
use crate::maps;
use crate::maps::MapsEntry;
use crate::maps::PathName;
use crate::namespace::get_nspid;
use crate::Addr;
use crate::Pid;
use crate::Reason;
use crate::Result;
use crate::Sym;
use crate::SymbolCache;
use crate::SymbolOptions;

use super::module::MapRange;
use super::module::Module;
use super::module::ModuleInfo;
use super::module::ModuleType;
use super::path::ModulePathResolver;
use super::perf_map::is_valid_perf_map;
use super::perf_map::perf_map_path;
use super::root::ProcessRootTracker;
use super::vdso::VDSO_COMPONENT;


/// A resolver of symbols in the address space of a single process.
///
/// The resolver caches the process' memory map along with the symbol
/// tables of the modules mapped into it. Symbol tables are loaded on
/// first use. By default, the memory map is rescanned transparently
/// when the process exec'ed or changed its root or mount namespace.
#[derive(Debug)]
pub struct ProcessSymbolResolver {
    pid: Pid,
    /// The process' modules, ordered by the start of their first range.
    modules: Vec<Module>,
    root: ProcessRootTracker,
    options: SymbolOptions,
}

impl ProcessSymbolResolver {
    /// Create a resolver for process `pid`, scanning its memory map.
    pub fn new(pid: Pid, options: SymbolOptions) -> Result<Self> {
        let mut slf = Self {
            pid,
            modules: Vec::new(),
            root: ProcessRootTracker::new(pid),
            options,
        };
        let () = slf.refresh()?;
        Ok(slf)
    }

    /// Retrieve the process this resolver is for.
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Retrieve the options symbols are loaded with.
    #[inline]
    pub fn options(&self) -> &SymbolOptions {
        &self.options
    }

    /// Retrieve a view of the process' modules, as of the last refresh.
    pub fn modules(&self) -> impl ExactSizeIterator<Item = ModuleInfo<'_>> {
        self.modules.iter().map(Module::info)
    }

    #[inline]
    fn enter_ns(&self) -> bool {
        !self.pid.is_self()
    }

    fn create_module(&self, name: String, entry: &MapsEntry) -> Option<Module> {
        let path = match entry.path_name.as_ref()? {
            // A deleted file is only reachable via `map_files`.
            PathName::Path(path) if path.deleted => {
                ModulePathResolver::new(&path.maps_file, None, self.pid, false)
            }
            PathName::Path(path) => ModulePathResolver::new(
                &path.symbolic_path,
                self.root.root_fd(),
                self.pid,
                self.enter_ns(),
            ),
            PathName::Component(component) => {
                ModulePathResolver::new(component, None, self.pid, false)
            }
        };
        Some(Module::new(name, path, entry.inode))
    }

    fn create_perf_map_module(&self) -> Option<Module> {
        let (tgid, nstgid) = get_nspid(self.pid).unwrap_or_else(|err| {
            debug!("failed to look up namespace PID of {}: {err:#}", self.pid);
            (self.pid, self.pid)
        });

        if self.enter_ns() {
            let path = ModulePathResolver::new(
                perf_map_path(nstgid),
                self.root.root_fd(),
                self.pid,
                true,
            );
            if is_valid_perf_map(path.path()) {
                let name = path.namespaced_path().to_string_lossy().into_owned();
                return Some(Module::perf_map(name, path))
            }
        }

        let path = ModulePathResolver::new(perf_map_path(tgid), None, self.pid, false);
        if is_valid_perf_map(path.path()) {
            let name = path.namespaced_path().to_string_lossy().into_owned();
            return Some(Module::perf_map(name, path))
        }
        None
    }

    /// Rescan the process' memory map.
    ///
    /// Modules whose name and inode are unchanged keep their symbol
    /// tables. If the memory map cannot be read, the previous set of
    /// modules is kept.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all, fields(pid = %self.pid)))]
    pub fn refresh(&mut self) -> Result<()> {
        let entries = maps::parse(self.pid)?.collect::<Result<Vec<_>>>()?;
        let _changed = self.root.refresh_root();

        let mut old = take(&mut self.modules);
        let mut modules = Vec::<Module>::new();
        let mut reused_count = 0;

        for entry in entries {
            if !maps::is_symbolization_relevant(&entry) {
                continue
            }

            let name = match &entry.path_name {
                Some(PathName::Path(path)) => {
                    if maps::is_perf_map_path(&path.symbolic_path) {
                        continue
                    }
                    path.symbolic_path.to_string_lossy().into_owned()
                }
                Some(PathName::Component(component)) if component == VDSO_COMPONENT => {
                    component.clone()
                }
                _ => continue,
            };

            let range = MapRange {
                start: entry.range.start,
                end: entry.range.end,
                file_offset: entry.offset,
            };

            if let Some(module) = modules.iter_mut().find(|module| module.name() == name) {
                let () = module.add_range(range);
                continue
            }

            let reused = old
                .iter()
                .position(|module| {
                    module.name() == name
                        && module.inode() == entry.inode
                        && module.type_() != ModuleType::PerfMap
                })
                .map(|idx| old.swap_remove(idx));

            let mut module = match reused {
                Some(mut module) => {
                    let () = module.clear_ranges();
                    reused_count += 1;
                    module
                }
                None => match self.create_module(name, &entry) {
                    Some(module) => module,
                    None => continue,
                },
            };
            let () = module.add_range(range);
            let () = modules.push(module);
        }

        if let Some(module) = self.create_perf_map_module() {
            let () = modules.push(module);
        }

        let () = modules.sort_by_key(|module| module.ranges().first().map(|range| range.start));
        debug!(
            "found {} modules in process {} ({} reused)",
            modules.len(),
            self.pid,
            reused_count,
        );

        self.modules = modules;
        let () = self.root.reset();
        Ok(())
    }

    fn refresh_if_stale(&mut self) {
        if self.options.auto_refresh && self.root.is_stale() {
            debug!("process {} changed; rescanning its memory map", self.pid);
            if let Err(err) = self.refresh() {
                warn!("failed to rescan memory map of process {}: {err:#}", self.pid);
            }
        }
    }

    /// Find the modules covering `addr`, searching regular modules first
    /// and perf maps second, and look up the symbol.
    ///
    /// Returns the index of the module providing the symbol, the index
    /// of the symbol in it, and the translated address.
    fn find_addr(&mut self, addr: Addr) -> Result<(usize, usize, u64), Reason> {
        let mut reason = Reason::Unmapped;

        for perf_map in [false, true] {
            for (idx, module) in self.modules.iter_mut().enumerate() {
                if (module.type_() == ModuleType::PerfMap) != perf_map {
                    continue
                }

                let offset = match module.contains(addr) {
                    Some(offset) => offset,
                    None => continue,
                };

                let () = module.load_sym_table(&self.options);
                match module.find_addr(offset) {
                    Ok(sym_idx) => return Ok((idx, sym_idx, offset)),
                    Err(err) => {
                        if !perf_map || reason == Reason::Unmapped {
                            reason = err;
                        }
                    }
                }

                // Regular modules never overlap.
                if !perf_map {
                    break
                }
            }
        }
        Err(reason)
    }

    /// Find the symbol covering `addr`.
    pub fn resolve_addr(&mut self, addr: Addr, demangle: bool) -> Result<Sym<'_>, Reason> {
        let () = self.refresh_if_stale();

        let (idx, sym_idx, offset) = self.find_addr(addr)?;
        let () = self.modules[idx].materialize(sym_idx)?;

        // Report the first module that covers the address, which is not
        // necessarily the perf map that provided the symbol.
        let covering = self
            .modules
            .iter()
            .find(|module| module.type_() != ModuleType::PerfMap && module.contains(addr).is_some())
            .map(Module::name);

        let mut sym = self.modules[idx].sym(sym_idx, offset, demangle)?;
        if let Some(name) = covering {
            sym.module = Some(name);
        }
        sym.addr = addr.wrapping_sub(sym.offset as Addr);
        Ok(sym)
    }

    /// Find the address of the symbol with the given name.
    ///
    /// If `module` is provided, only the module with that name (either
    /// its full path or file name) is searched. Otherwise all modules
    /// are searched, in address order.
    pub fn resolve_name(&mut self, module: Option<&str>, name: &str) -> Result<Addr, Reason> {
        let () = self.refresh_if_stale();

        let mut found_module = false;
        for candidate in self.modules.iter_mut() {
            if let Some(module) = module {
                if !candidate.matches_name(module) {
                    continue
                }
            }

            found_module = true;
            let () = candidate.load_sym_table(&self.options);
            if let Some(addr) = candidate.find_name(name) {
                return Ok(addr)
            }
        }

        if module.is_some() && !found_module {
            Err(Reason::UnknownModule)
        } else {
            Err(Reason::UnknownName)
        }
    }
}

impl SymbolCache for ProcessSymbolResolver {
    fn refresh(&mut self) -> Result<()> {
        ProcessSymbolResolver::refresh(self)
    }

    fn resolve_addr(&mut self, addr: Addr, demangle: bool) -> Result<Sym<'_>, Reason> {
        ProcessSymbolResolver::resolve_addr(self, addr, demangle)
    }

    fn resolve_name(&mut self, module: Option<&str>, name: &str) -> Result<Addr, Reason> {
        ProcessSymbolResolver::resolve_name(self, module, name)
    }
}
