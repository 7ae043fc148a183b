use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use crate::process::VDSO_COMPONENT;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Pid;
use crate::Result;


/// The suffix the kernel appends to paths of files that got deleted
/// while still being mapped.
const DELETED_SUFFIX: &str = " (deleted)";


/// A path as found in a proc maps entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EntryPath {
    /// The path to the entry below `/proc/<pid>/map_files/`, which
    /// stays usable even if the file got deleted.
    pub maps_file: PathBuf,
    /// The path as reported in the maps file, relative to the mount
    /// namespace of the process and with any deletion marker removed.
    pub symbolic_path: PathBuf,
    /// Whether the kernel reported the file as deleted.
    pub deleted: bool,
}


/// The "name" of a maps entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PathName {
    /// An actual path to a file.
    Path(EntryPath),
    /// A kernel provided component, such as `[vdso]` or `[heap]`.
    Component(String),
}

impl PathName {
    #[cfg(test)]
    pub(crate) fn as_path(&self) -> Option<&EntryPath> {
        match self {
            Self::Path(path) => Some(path),
            Self::Component(..) => None,
        }
    }

    pub(crate) fn as_component(&self) -> Option<&str> {
        match self {
            Self::Component(component) => Some(component),
            Self::Path(..) => None,
        }
    }
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MapsEntry {
    /// The virtual address range covered by this entry.
    pub range: Range<Addr>,
    /// The permissions of the mapping, folded into a bit field in
    /// `rwxp` order, with `r` being the most significant bit.
    pub mode: u8,
    /// The offset into the backing file at which the mapping starts.
    pub offset: u64,
    /// The inode of the backing file, or zero for anonymous mappings.
    pub inode: u64,
    /// The path name component, if any.
    pub path_name: Option<PathName>,
}

impl MapsEntry {
    /// Check whether the mapping is executable.
    #[inline]
    pub(crate) fn is_exec(&self) -> bool {
        (self.mode & 0b0010) != 0
    }
}


/// Parse a line of a proc maps file.
fn parse_maps_line<'line>(line: &'line str, pid: Pid) -> Result<MapsEntry> {
    let full_line = line;

    let split_once = |line: &'line str, component| -> Result<(&'line str, &'line str)> {
        line.split_once(|c: char| c.is_ascii_whitespace())
            .ok_or_else(|| {
                Error::with_invalid_data(format!(
                    "failed to find {component} in proc maps line: {line}\n{full_line}"
                ))
            })
    };

    // Lines have the following format:
    // address           perms offset  dev   inode      pathname
    // 08048000-08049000 r-xp 00000000 03:00 8312       /opt/test
    // 0804a000-0806b000 rw-p 00000000 00:00 0          [heap]
    // a7cb1000-a7cb2000 ---p 00000000 00:00 0
    // a7ed5000-a8008000 r-xp 00000000 03:00 4222       /lib/libc.so.6
    let (address_str, line) = split_once(line, "address range")?;
    let (loaded_str, end_str) = address_str.split_once('-').ok_or_else(|| {
        Error::with_invalid_data(format!(
            "encountered malformed address range in proc maps line: {full_line}"
        ))
    })?;
    let loaded_address = Addr::from_str_radix(loaded_str, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed start address in proc maps line: {full_line}: {err}"
        ))
    })?;
    let end_address = Addr::from_str_radix(end_str, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed end address in proc maps line: {full_line}: {err}"
        ))
    })?;

    let (mode_str, line) = split_once(line, "permissions component")?;
    let mode = mode_str
        .chars()
        .fold(0, |mode, c| (mode << 1) | u8::from(c != '-'));

    let (offset_str, line) = split_once(line, "offset component")?;
    let offset = u64::from_str_radix(offset_str, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed offset component in proc maps line: {full_line}: {err}"
        ))
    })?;

    let (_dev, line) = split_once(line, "device component")?;
    let line = line.trim_start();
    // A path may not be present and so we may not be able to
    // successfully split.
    let (inode_str, path_str) = match split_once(line, "inode component") {
        Ok((inode_str, line)) => (inode_str, line.trim()),
        Err(..) => (line.trim(), ""),
    };
    let inode = inode_str.parse::<u64>().map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed inode component in proc maps line: {full_line}: {err}"
        ))
    })?;

    let path_name = if path_str.is_empty() {
        None
    } else if path_str.starts_with('[') && path_str.ends_with(']') {
        Some(PathName::Component(path_str.to_string()))
    } else {
        let (symbolic_path, deleted) = match path_str.strip_suffix(DELETED_SUFFIX) {
            Some(path) => (path, true),
            None => (path_str, false),
        };
        let maps_file = PathBuf::from(format!("/proc/{pid}/map_files/{address_str}"));
        Some(PathName::Path(EntryPath {
            maps_file,
            symbolic_path: PathBuf::from(symbolic_path),
            deleted,
        }))
    };

    let entry = MapsEntry {
        range: (loaded_address..end_address),
        mode,
        offset,
        inode,
        path_name,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
    pid: Pid,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<MapsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(Error::from(err))),
                Ok(0) => break None,
                Ok(_) => {
                    let line_str = self.line.trim();
                    // There shouldn't be any empty lines, but we'd just ignore them. We
                    // need to trim anyway.
                    if !line_str.is_empty() {
                        let result = parse_maps_line(line_str, self.pid);
                        break Some(result)
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
pub(crate) fn parse_file<R>(reader: R, pid: Pid) -> impl Iterator<Item = Result<MapsEntry>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
        pid,
    }
}

/// Parse the maps file for the process with the given PID.
pub(crate) fn parse(pid: Pid) -> Result<impl Iterator<Item = Result<MapsEntry>>> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path).with_context(|| format!("failed to open `{path}`"))?;
    let iter = parse_file(file, pid);
    Ok(iter)
}

/// Check whether a `MapsEntry` is of relevance to symbolization of
/// addresses inside of it.
///
/// Only executable mappings backed by a file or by the vDSO are
/// considered.
pub(crate) fn is_symbolization_relevant(entry: &MapsEntry) -> bool {
    if !entry.is_exec() {
        return false
    }

    match &entry.path_name {
        Some(PathName::Path(path)) => path.symbolic_path.is_absolute(),
        Some(PathName::Component(component)) => component == VDSO_COMPONENT,
        None => false,
    }
}

/// Check whether `path` (as reported in a maps file) refers to a
/// perf map of some process.
pub(crate) fn is_perf_map_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("perf-"))
        .and_then(|name| name.strip_suffix(".map"))
        .map(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}
