//! A writer of small synthetic ELF files for use in tests.

use std::mem::size_of;
use std::slice;

use crate::elf::types::Elf64_Ehdr;
use crate::elf::types::Elf64_Nhdr;
use crate::elf::types::Elf64_Shdr;
use crate::elf::types::Elf64_Sym;
use crate::elf::types::ELFCLASS64;
use crate::elf::types::ELFMAG;
use crate::elf::types::ET_DYN;
use crate::elf::types::NT_GNU_BUILD_ID;
use crate::elf::types::SHF_ALLOC;
use crate::elf::types::SHF_EXECINSTR;
use crate::elf::types::SHT_DYNSYM;
use crate::elf::types::SHT_NOTE;
use crate::elf::types::SHT_PROGBITS;
use crate::elf::types::SHT_STRTAB;
use crate::elf::types::SHT_SYMTAB;
use crate::elf::types::STB_GLOBAL;
use crate::elf::types::STT_FUNC;
use crate::elf::types::STT_OBJECT;
use crate::util::Pod;

const SHN_ABS: u16 = 0xfff1;
const EM_X86_64: u16 = 62;


fn push_pod<T>(buf: &mut Vec<u8>, value: &T)
where
    T: Pod,
{
    // SAFETY: `T` is `Pod` and, as all ELF structures, free of padding.
    let bytes = unsafe { slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) };
    let () = buf.extend_from_slice(bytes);
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    let () = buf.resize(buf.len().next_multiple_of(align), 0);
}


/// A symbol to add to a synthetic ELF file.
#[derive(Clone, Debug)]
pub struct SymSpec {
    name: String,
    addr: u64,
    size: u64,
    type_: u8,
}

impl SymSpec {
    /// Describe a function symbol.
    pub fn func(name: &str, addr: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            addr,
            size,
            type_: STT_FUNC,
        }
    }

    /// Describe a variable symbol.
    pub fn object(name: &str, addr: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            addr,
            size,
            type_: STT_OBJECT,
        }
    }
}


/// Encode `syms` as symbol table and accompanying string table.
fn encode_symbols(syms: &[SymSpec], shndx: u16) -> (Vec<u8>, Vec<u8>) {
    let mut table = Vec::new();
    let mut strtab = vec![0];

    let () = push_pod(&mut table, &Elf64_Sym::default());
    for sym in syms {
        let st_name = strtab.len() as u32;
        let () = strtab.extend_from_slice(sym.name.as_bytes());
        let () = strtab.push(0);

        let sym = Elf64_Sym {
            st_name,
            st_info: (STB_GLOBAL << 4) | sym.type_,
            st_other: 0,
            st_shndx: shndx,
            st_value: sym.addr,
            st_size: sym.size,
        };
        let () = push_pod(&mut table, &sym);
    }
    (table, strtab)
}


#[derive(Debug)]
struct Section {
    name: &'static str,
    shdr: Elf64_Shdr,
    data: Vec<u8>,
    /// The file offset the section has to be placed at, if any.
    offset: Option<u64>,
}

impl Section {
    fn new(name: &'static str, sh_type: u32, data: Vec<u8>) -> Self {
        Self {
            name,
            shdr: Elf64_Shdr {
                sh_type,
                sh_addralign: 1,
                ..Default::default()
            },
            data,
            offset: None,
        }
    }
}


/// A builder of synthetic 64 bit ELF files.
#[derive(Clone, Debug)]
pub struct ElfBuilder {
    e_type: u16,
    /// The `.text` section's address, file offset, and size.
    text: Option<(u64, u64, u64)>,
    symbols: Vec<SymSpec>,
    dynamic_symbols: Vec<SymSpec>,
    symtab: bool,
    debug_link: Option<(String, u32)>,
    build_id: Option<Vec<u8>>,
}

impl ElfBuilder {
    /// Create a builder for an ELF file of the given type (`ET_*`).
    pub fn new(e_type: u16) -> Self {
        Self {
            e_type,
            text: None,
            symbols: Vec::new(),
            dynamic_symbols: Vec::new(),
            symtab: true,
            debug_link: None,
            build_id: None,
        }
    }

    /// Create a builder for a shared object.
    pub fn shared_object() -> Self {
        Self::new(ET_DYN)
    }

    /// Add a `.text` section at virtual address `addr` and file offset
    /// `offset`.
    ///
    /// The offset has to lie past the ELF header.
    pub fn text(mut self, addr: u64, offset: u64, size: u64) -> Self {
        self.text = Some((addr, offset, size));
        self
    }

    /// Add a symbol to the `.symtab` section.
    pub fn symbol(mut self, sym: SymSpec) -> Self {
        let () = self.symbols.push(sym);
        self
    }

    /// Add a symbol to the `.dynsym` section.
    pub fn dynamic_symbol(mut self, sym: SymSpec) -> Self {
        let () = self.dynamic_symbols.push(sym);
        self
    }

    /// Omit the `.symtab` section, as a stripped binary would.
    pub fn no_symtab(mut self) -> Self {
        self.symtab = false;
        self
    }

    /// Add a `.gnu_debuglink` section.
    pub fn debug_link(mut self, file: &str, crc: u32) -> Self {
        self.debug_link = Some((file.to_string(), crc));
        self
    }

    /// Add a `.note.gnu.build-id` section.
    pub fn build_id(mut self, build_id: &[u8]) -> Self {
        self.build_id = Some(build_id.to_vec());
        self
    }

    fn sections(&self) -> Vec<Section> {
        let mut sections = vec![Section::new("", 0, Vec::new())];
        let mut shndx = SHN_ABS;

        if let Some((addr, offset, size)) = self.text {
            let mut text = Section::new(".text", SHT_PROGBITS, vec![0xcc; size as usize]);
            text.shdr.sh_flags = SHF_ALLOC | SHF_EXECINSTR;
            text.shdr.sh_addr = addr;
            text.shdr.sh_addralign = 16;
            text.offset = Some(offset);
            shndx = sections.len() as u16;
            let () = sections.push(text);
        }

        if let Some(build_id) = &self.build_id {
            let mut data = Vec::new();
            let nhdr = Elf64_Nhdr {
                n_namesz: 4,
                n_descsz: build_id.len() as u32,
                n_type: NT_GNU_BUILD_ID,
            };
            let () = push_pod(&mut data, &nhdr);
            let () = data.extend_from_slice(b"GNU\0");
            let () = data.extend_from_slice(build_id);
            let () = pad_to(&mut data, 4);

            let mut note = Section::new(".note.gnu.build-id", SHT_NOTE, data);
            note.shdr.sh_flags = SHF_ALLOC;
            note.shdr.sh_addralign = 4;
            let () = sections.push(note);
        }

        if let Some((file, crc)) = &self.debug_link {
            let mut data = file.as_bytes().to_vec();
            let () = data.push(0);
            let () = pad_to(&mut data, 4);
            let () = data.extend_from_slice(&crc.to_ne_bytes());

            let mut link = Section::new(".gnu_debuglink", SHT_PROGBITS, data);
            link.shdr.sh_addralign = 4;
            let () = sections.push(link);
        }

        let tables = [
            (!self.dynamic_symbols.is_empty(), &self.dynamic_symbols, ".dynsym", ".dynstr", SHT_DYNSYM),
            (self.symtab, &self.symbols, ".symtab", ".strtab", SHT_SYMTAB),
        ];
        for (enabled, syms, name, strtab_name, sh_type) in tables {
            if !enabled {
                continue
            }

            let (table, strtab) = encode_symbols(syms, shndx);
            let mut symtab = Section::new(name, sh_type, table);
            symtab.shdr.sh_link = sections.len() as u32 + 1;
            symtab.shdr.sh_info = 1;
            symtab.shdr.sh_entsize = size_of::<Elf64_Sym>() as u64;
            symtab.shdr.sh_addralign = 8;
            if sh_type == SHT_DYNSYM {
                symtab.shdr.sh_flags = SHF_ALLOC;
            }
            let () = sections.push(symtab);
            let () = sections.push(Section::new(strtab_name, SHT_STRTAB, strtab));
        }

        let () = sections.push(Section::new(".shstrtab", SHT_STRTAB, Vec::new()));
        sections
    }

    /// Create the ELF file's contents.
    pub fn build(&self) -> Vec<u8> {
        let mut sections = self.sections();

        let mut shstrtab = vec![0];
        for section in sections.iter_mut().skip(1) {
            section.shdr.sh_name = shstrtab.len() as u32;
            let () = shstrtab.extend_from_slice(section.name.as_bytes());
            let () = shstrtab.push(0);
        }
        let shstrndx = sections.len() - 1;
        sections[shstrndx].data = shstrtab;

        let mut elf = vec![0; size_of::<Elf64_Ehdr>()];
        for section in sections.iter_mut().skip(1) {
            match section.offset {
                Some(offset) if offset as usize >= elf.len() => {
                    let () = elf.resize(offset as usize, 0);
                }
                _ => pad_to(&mut elf, 8),
            }
            section.shdr.sh_offset = elf.len() as u64;
            section.shdr.sh_size = section.data.len() as u64;
            let () = elf.extend_from_slice(&section.data);
        }

        let () = pad_to(&mut elf, 8);
        let shoff = elf.len() as u64;
        for section in &sections {
            let () = push_pod(&mut elf, &section.shdr);
        }

        let mut e_ident = [0; 16];
        e_ident[..4].copy_from_slice(&ELFMAG);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = if cfg!(target_endian = "little") { 1 } else { 2 };
        e_ident[6] = 1;

        let ehdr = Elf64_Ehdr {
            e_ident,
            e_type: self.e_type,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: shoff,
            e_flags: 0,
            e_ehsize: size_of::<Elf64_Ehdr>() as u16,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: size_of::<Elf64_Shdr>() as u16,
            e_shnum: sections.len() as u16,
            e_shstrndx: shstrndx as u16,
        };
        let mut header = Vec::new();
        let () = push_pod(&mut header, &ehdr);
        elf[..header.len()].copy_from_slice(&header);
        elf
    }
}
