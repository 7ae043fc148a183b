mod build_id;
mod debug;
mod parser;
pub(crate) mod types;

pub(crate) use build_id::read_build_id;
pub(crate) use debug::build_id_path;
pub(crate) use debug::find_debug_file;
pub(crate) use parser::ElfParser;
pub(crate) use parser::SymTable;
pub(crate) use parser::TextInfo;

#[cfg(test)]
pub(crate) use debug::debug_link_crc32;
