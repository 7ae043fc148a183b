//! Discovery of separate debug files.
//!
//! Distributions commonly strip binaries and ship their symbol tables
//! in separate files, which are found either via the binary's GNU
//! build ID (`<debug-dir>/.build-id/xx/yyyy.debug`) or via the file
//! name and checksum recorded in its `.gnu_debuglink` section.

use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

use crate::log::debug;
use crate::mmap::Mmap;
use crate::util::bytes_to_hex;
use crate::util::bytes_to_os_str;
use crate::util::ReadRaw as _;
use crate::IntoError as _;
use crate::Result;
use crate::SymbolOptions;

use super::read_build_id;
use super::ElfParser;


const DEBUG_LINK_SECTION: &str = ".gnu_debuglink";


/// Read the `.gnu_debuglink` section of an ELF file, if present,
/// returning the linked file name along with its expected checksum.
pub(crate) fn read_debug_link(parser: &ElfParser) -> Result<Option<(&OsStr, u32)>> {
    let idx = if let Some(idx) = parser.find_section(DEBUG_LINK_SECTION)? {
        idx
    } else {
        return Ok(None)
    };

    let data = parser.section_data(idx)?;
    parse_debug_link(data).map(Some)
}

fn parse_debug_link(mut data: &[u8]) -> Result<(&OsStr, u32)> {
    let len = data.len();
    let file = data
        .read_cstr()
        .ok_or_invalid_data(|| "failed to read debug link file name")?;
    let file = bytes_to_os_str(file.to_bytes())?;

    // The checksum is aligned to the next four byte boundary relative
    // to the start of the section.
    let name_len = len - data.len();
    let () = data
        .advance(name_len.next_multiple_of(4) - name_len)
        .ok_or_invalid_data(|| "debug link section contains insufficient data")?;
    let crc = data
        .read_u32()
        .ok_or_invalid_data(|| "failed to read debug link checksum")?;
    Ok((file, crc))
}


const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                0xedb88320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();


/// Calculate the checksum of a debug file, as recorded in
/// `.gnu_debuglink`.
pub(crate) fn debug_link_crc32(data: &[u8]) -> u32 {
    let crc = data.iter().fold(!0u32, |crc, byte| {
        CRC32_TABLE[((crc ^ u32::from(*byte)) & 0xff) as usize] ^ (crc >> 8)
    });
    !crc
}


/// Construct the path of a debug file for the given build ID below
/// `dir`, optionally appending a `.debug` suffix.
pub(crate) fn build_id_path(dir: &Path, build_id: &str, debug_suffix: bool) -> Option<PathBuf> {
    if build_id.len() < 3 || !build_id.is_char_boundary(2) {
        return None
    }

    let (prefix, rest) = build_id.split_at(2);
    let file = if debug_suffix {
        format!("{rest}.debug")
    } else {
        rest.to_string()
    };
    Some(dir.join(".build-id").join(prefix).join(file))
}


fn find_debug_via_build_id(parser: &ElfParser, dirs: &[PathBuf]) -> Result<Option<PathBuf>> {
    let build_id = if let Some(build_id) = read_build_id(parser)? {
        bytes_to_hex(&build_id)
    } else {
        return Ok(None)
    };

    let path = dirs
        .iter()
        .filter_map(|dir| build_id_path(dir, &build_id, true))
        .find(|path| path.exists());
    Ok(path)
}

fn verify_checksum(path: &Path, crc: u32) -> bool {
    match Mmap::open(path) {
        Ok(mmap) => {
            let actual = debug_link_crc32(&mmap);
            if actual != crc {
                debug!(
                    "debug file `{}` checksum mismatch: {actual:#x} (expected {crc:#x})",
                    path.display()
                );
            }
            actual == crc
        }
        Err(err) => {
            debug!("failed to read debug file `{}`: {err}", path.display());
            false
        }
    }
}

fn find_debug_via_debug_link(
    binary: &Path,
    parser: &ElfParser,
    opts: &SymbolOptions,
) -> Result<Option<PathBuf>> {
    let (file, crc) = if let Some(link) = read_debug_link(parser)? {
        link
    } else {
        return Ok(None)
    };

    let bin_dir = binary.parent().unwrap_or_else(|| Path::new("/"));
    let rel_dir = bin_dir.strip_prefix("/").unwrap_or(bin_dir);

    let mut candidates = vec![bin_dir.join(file), bin_dir.join(".debug").join(file)];
    let () = candidates.extend(opts.debug_dirs.iter().map(|dir| dir.join(rel_dir).join(file)));

    let path = candidates.into_iter().find(|path| {
        path != binary
            && path.exists()
            && (!opts.check_debug_file_crc || verify_checksum(path, crc))
    });
    Ok(path)
}


/// Find the separate debug file belonging to the ELF file at `binary`.
///
/// The build ID based location takes precedence over the debug link.
#[cfg_attr(feature = "tracing", crate::log::instrument(skip(parser, opts), fields(binary = ?binary)))]
pub(crate) fn find_debug_file(
    binary: &Path,
    parser: &ElfParser,
    opts: &SymbolOptions,
) -> Result<Option<PathBuf>> {
    if let Some(path) = find_debug_via_build_id(parser, &opts.debug_dirs)? {
        return Ok(Some(path))
    }
    find_debug_via_debug_link(binary, parser, opts)
}
