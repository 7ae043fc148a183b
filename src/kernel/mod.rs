mod ksym;

pub use ksym::KernelSymbolTable;
pub use ksym::KALLSYMS;
