use std::ops::Range;

use crate::elf::ElfParser;
use crate::maps;
use crate::maps::PathName;
use crate::Addr;
use crate::Error;
use crate::Pid;
use crate::Result;


/// The name of the "component" representing the vDSO inside
/// `/proc/<pid>/maps`.
pub(crate) const VDSO_COMPONENT: &str = "[vdso]";


/// Find the memory range of our own vDSO.
///
/// `getauxval(3)` would report the vDSO's address, but not its size,
/// so we consult `/proc/self/maps` instead.
pub(crate) fn find_vdso() -> Result<Option<Range<Addr>>> {
    for result in maps::parse(Pid::Slf)? {
        let entry = result?;
        if entry.path_name.as_ref().and_then(PathName::as_component) == Some(VDSO_COMPONENT) {
            return Ok(Some(entry.range))
        }
    }
    Ok(None)
}


/// Create an [`ElfParser`] for our own vDSO.
///
/// The vDSO is the same for every process running on a given kernel,
/// so our own image can stand in for that of any other process.
#[cfg(target_os = "linux")]
pub(crate) fn create_vdso_parser() -> Result<ElfParser> {
    use std::slice;

    let range = find_vdso()?.ok_or_else(|| Error::with_not_found("failed to find vDSO"))?;
    let data = range.start as *const u8;
    let len = range.end.saturating_sub(range.start);
    // SAFETY: `range` represents the memory range of the vDSO, which is
    //         mapped readable by the kernel and never vanishes.
    let mem = unsafe { slice::from_raw_parts(data, len as usize) };
    ElfParser::from_static(mem)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn create_vdso_parser() -> Result<ElfParser> {
    Err(Error::with_unsupported(
        "vDSO symbolization is unsupported on operating systems other than Linux",
    ))
}
