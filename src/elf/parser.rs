use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::mem;
use std::ops::Deref as _;
use std::path::Path;
use std::str;

use crate::mmap::Mmap;
use crate::util::ReadRaw as _;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf64_Ehdr;
use super::types::Elf64_Shdr;
use super::types::Elf64_Sym;
use super::types::ELFCLASS64;
use super::types::ELFMAG;
use super::types::SHN_XINDEX;
use super::types::SHT_NOBITS;


/// A symbol table along with the string table its names are stored in.
#[derive(Debug)]
pub(crate) struct SymTable<'elf> {
    /// The raw symbols, in file order.
    pub syms: &'elf [Elf64_Sym],
    /// The index of the string table section.
    pub strtab_idx: usize,
    /// The contents of the string table section.
    pub strtab: &'elf [u8],
}

impl<'elf> SymTable<'elf> {
    /// Read the name of `sym` from the associated string table.
    pub fn name(&self, sym: &Elf64_Sym) -> Result<&'elf str> {
        read_str(self.strtab, sym.st_name as usize)
    }
}


/// Information about the `.text` section, as relevant for address
/// translation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TextInfo {
    /// The section's virtual address.
    pub addr: u64,
    /// The section's file offset.
    pub offset: u64,
}


fn read_str(strs: &[u8], offset: usize) -> Result<&str> {
    let name = strs
        .get(offset..)
        .ok_or_invalid_input(|| format!("string table index ({offset}) out of bounds"))?
        .read_cstr()
        .ok_or_invalid_data(|| "no valid string found in string table")?
        .to_str()
        .map_err(Error::with_invalid_data)
        .context("invalid string in string table")?;
    Ok(name)
}


enum Backing {
    /// The ELF data are backed by a memory mapped file.
    Mmap(Mmap),
    /// The ELF data are part of our address space for our lifetime,
    /// as is the case for the vDSO.
    Static,
}


/// A parser for ELF64 files.
pub(crate) struct ElfParser {
    // SAFETY: We must not hand out references with a 'static lifetime to
    //         any of the following members. Rather, they should never
    //         outlive `self`. They have to be listed before `_backing`
    //         to make sure we never end up with a dangling reference.
    data: &'static [u8],
    ehdr: &'static Elf64_Ehdr,
    shdrs: &'static [Elf64_Shdr],
    shstrtab: &'static [u8],
    _backing: Backing,
}

impl ElfParser {
    /// Create an `ElfParser` for a path.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
        Self::open_file(&file).with_context(|| format!("failed to parse `{}`", path.display()))
    }

    /// Create an `ElfParser` from an open file.
    pub fn open_file(file: &File) -> Result<Self> {
        let mmap = Mmap::map(file).context("failed to memory map file")?;
        Self::from_mmap(mmap)
    }

    /// Create an `ElfParser` from mmap'ed data.
    pub fn from_mmap(mmap: Mmap) -> Result<Self> {
        // We transmute the mmap's lifetime to static here as that is a
        // necessity for self-referentiality.
        // SAFETY: We never hand out any 'static references to ELF data.
        let data = unsafe { mem::transmute::<&[u8], &'static [u8]>(mmap.deref()) };
        Self::new(data, Backing::Mmap(mmap))
    }

    /// Create an `ElfParser` for data that stay valid for the lifetime
    /// of the program.
    pub fn from_static(data: &'static [u8]) -> Result<Self> {
        Self::new(data, Backing::Static)
    }

    fn new(data: &'static [u8], backing: Backing) -> Result<Self> {
        let mut cursor = data;
        let ehdr = cursor
            .read_pod_ref::<Elf64_Ehdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Ehdr")?;
        if ehdr.e_ident[0..4] != ELFMAG {
            return Err(Error::with_invalid_data(format!(
                "encountered unexpected e_ident: {:x?}",
                &ehdr.e_ident[0..4]
            )))
        }
        if ehdr.e_ident[4] != ELFCLASS64 {
            return Err(Error::with_unsupported(format!(
                "unsupported ELF class ({})",
                ehdr.e_ident[4]
            )))
        }

        let shdrs: &[Elf64_Shdr] = if ehdr.e_shoff == 0 {
            &[]
        } else {
            let first = data
                .get(ehdr.e_shoff as usize..)
                .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
                .read_pod_ref::<Elf64_Shdr>()
                .ok_or_invalid_data(|| "failed to read Elf64_Shdr")?;

            // If the number of sections is too large to fit `e_shnum`,
            // the real count is stored in the first section header.
            let shnum = if ehdr.e_shnum == 0 {
                usize::try_from(first.sh_size).ok().ok_or_invalid_data(|| {
                    format!(
                        "ELF file contains unsupported number of sections ({})",
                        first.sh_size
                    )
                })?
            } else {
                ehdr.e_shnum.into()
            };

            data.get(ehdr.e_shoff as usize..)
                .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
                .read_pod_slice_ref::<Elf64_Shdr>(shnum)
                .ok_or_invalid_data(|| "failed to read Elf64_Shdr")?
        };

        let shstrndx = if ehdr.e_shstrndx == SHN_XINDEX {
            shdrs
                .first()
                .map(|shdr| shdr.sh_link as usize)
                .ok_or_invalid_data(|| "ELF file lacks initial section header")?
        } else {
            usize::from(ehdr.e_shstrndx)
        };

        let shstrtab: &[u8] = match shdrs.get(shstrndx) {
            Some(shdr) if shstrndx != 0 => section_data_impl(data, shdr)?,
            _ => &[],
        };

        let slf = Self {
            data,
            ehdr,
            shdrs,
            shstrtab,
            _backing: backing,
        };
        Ok(slf)
    }

    /// Retrieve the ELF file's type (`ET_*`).
    #[inline]
    pub fn elf_type(&self) -> u16 {
        self.ehdr.e_type
    }

    /// Retrieve all section headers.
    #[inline]
    pub fn section_headers(&self) -> &[Elf64_Shdr] {
        self.shdrs
    }

    /// Retrieve the section header at index `idx`.
    pub fn section_header(&self, idx: usize) -> Result<&Elf64_Shdr> {
        self.shdrs
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))
    }

    /// Retrieve the data corresponding to the ELF section at index `idx`.
    pub fn section_data(&self, idx: usize) -> Result<&[u8]> {
        let shdr = self.section_header(idx)?;
        section_data_impl(self.data, shdr)
    }

    /// Get the name of the section at a given index.
    pub fn section_name(&self, idx: usize) -> Result<&str> {
        let shdr = self.section_header(idx)?;
        read_str(self.shstrtab, shdr.sh_name as usize).context("invalid section name")
    }

    /// Find the section of a given name.
    ///
    /// This function return the index of the section if found.
    pub fn find_section(&self, name: &str) -> Result<Option<usize>> {
        for idx in 1..self.shdrs.len() {
            if self.section_name(idx)? == name {
                return Ok(Some(idx))
            }
        }
        Ok(None)
    }

    /// Retrieve the virtual address and file offset of the `.text`
    /// section, if present.
    pub fn text_info(&self) -> Result<Option<TextInfo>> {
        let info = self.find_section(".text")?.map(|idx| {
            let shdr = &self.shdrs[idx];
            TextInfo {
                addr: shdr.sh_addr,
                offset: shdr.sh_offset,
            }
        });
        Ok(info)
    }

    /// Retrieve the symbol table stored in the section with the given
    /// name (typically `.symtab` or `.dynsym`).
    pub fn symbol_table(&self, section: &str) -> Result<Option<SymTable<'_>>> {
        let idx = if let Some(idx) = self.find_section(section)? {
            idx
        } else {
            return Ok(None)
        };

        let mut data = self.section_data(idx)?;
        if data.len() % mem::size_of::<Elf64_Sym>() != 0 {
            return Err(Error::with_invalid_data(format!(
                "size of symbol table section `{section}` is invalid"
            )))
        }

        let count = data.len() / mem::size_of::<Elf64_Sym>();
        let syms = data
            .read_pod_slice_ref::<Elf64_Sym>(count)
            .ok_or_invalid_data(|| "failed to read symbol table contents")?;
        let strtab_idx = self.shdrs[idx].sh_link as usize;
        let strtab = self.section_data(strtab_idx)?;

        let table = SymTable {
            syms,
            strtab_idx,
            strtab,
        };
        Ok(Some(table))
    }

    /// Read a string of known length `len` from the string table
    /// section at index `section_idx`.
    pub fn read_str(&self, section_idx: usize, offset: usize, len: usize) -> Result<&str> {
        let strs = self.section_data(section_idx)?;
        let bytes = strs
            .get(offset..)
            .ok_or_invalid_input(|| format!("string table index ({offset}) out of bounds"))?
            .read_slice(len)
            .ok_or_invalid_data(|| format!("string of length {len} exceeds string table"))?;
        str::from_utf8(bytes)
            .map_err(Error::with_invalid_data)
            .context("invalid string in string table")
    }
}

impl Debug for ElfParser {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ElfParser")
            .field("type", &self.ehdr.e_type)
            .field("sections", &self.shdrs.len())
            .finish()
    }
}


fn section_data_impl<'data>(data: &'data [u8], shdr: &Elf64_Shdr) -> Result<&'data [u8]> {
    if shdr.sh_type == SHT_NOBITS {
        return Ok(&[])
    }

    let data = data
        .get(shdr.sh_offset as usize..)
        .ok_or_invalid_data(|| "failed to read section data: invalid offset")?
        .read_slice(shdr.sh_size as usize)
        .ok_or_invalid_data(|| "failed to read section data: invalid size")?;
    Ok(data)
}
