use crate::log::debug;
use crate::util::ReadRaw as _;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf64_Nhdr;
use super::types::NT_GNU_BUILD_ID;
use super::types::SHT_NOTE;
use super::ElfParser;


/// The name of the section the linker (typically) places the build ID
/// note in.
const BUILD_ID_SECTION: &str = ".note.gnu.build-id";


/// Calculate the number of padding bytes following a note field of
/// `len` bytes.
#[inline]
fn padding(len: u32) -> usize {
    (4 - (len as usize % 4)) % 4
}


/// Walk the notes contained in `data`, looking for a GNU build ID.
fn find_build_id_note(mut data: &[u8]) -> Result<Option<&[u8]>> {
    while !data.is_empty() {
        let nhdr = data
            .read_pod::<Elf64_Nhdr>()
            .ok_or_invalid_data(|| "failed to read ELF note header")?;
        let name = data
            .read_slice(nhdr.n_namesz as usize)
            .ok_or_invalid_data(|| "ELF note name exceeds section")?;
        let () = data
            .advance(padding(nhdr.n_namesz))
            .ok_or_invalid_data(|| "ELF note name padding exceeds section")?;
        let desc = data
            .read_slice(nhdr.n_descsz as usize)
            .ok_or_invalid_data(|| "ELF note descriptor exceeds section")?;
        // The last note's padding may be missing.
        let _padded = data.advance(padding(nhdr.n_descsz));

        if nhdr.n_type == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Ok(Some(desc))
        }
    }
    Ok(None)
}


/// Read the GNU build ID of an ELF file.
///
/// The dedicated `.note.gnu.build-id` section is checked first,
/// followed by all other note sections.
#[cfg_attr(feature = "tracing", crate::log::instrument(skip_all))]
pub(crate) fn read_build_id(parser: &ElfParser) -> Result<Option<Vec<u8>>> {
    if let Some(idx) = parser.find_section(BUILD_ID_SECTION)? {
        let shdr = parser.section_header(idx)?;
        if shdr.sh_type == SHT_NOTE {
            if let Some(build_id) = find_build_id_note(parser.section_data(idx)?)? {
                return Ok(Some(build_id.to_vec()))
            }
        } else {
            debug!(
                "build ID section {BUILD_ID_SECTION} is of unsupported type ({})",
                shdr.sh_type
            );
        }
    }

    for (idx, shdr) in parser.section_headers().iter().enumerate() {
        if shdr.sh_type == SHT_NOTE {
            if let Some(build_id) = find_build_id_note(parser.section_data(idx)?)? {
                return Ok(Some(build_id.to_vec()))
            }
        }
    }
    Ok(None)
}
