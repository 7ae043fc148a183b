//! Symbolization of addresses in the address space of user space
//! processes.

mod module;
mod path;
mod perf_map;
mod resolver;
mod root;
mod vdso;

pub use module::MapRange;
pub use module::ModuleInfo;
pub use module::ModuleType;
pub use path::ModulePathResolver;
pub use resolver::ProcessSymbolResolver;
pub use root::ProcessRootTracker;

pub(crate) use vdso::VDSO_COMPONENT;
