//! Support for perf map files, as written by JIT compilers.
//!
//! See <https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/tools/perf/Documentation/jit-interface.txt>

use std::path::Path;
use std::path::PathBuf;
use std::str;

use crate::log::debug;
use crate::mmap::Mmap;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Pid;
use crate::Result;


/// A single function as listed in a perf map.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Function<'data> {
    /// The name of the function.
    pub name: &'data str,
    /// The function's start address.
    pub addr: Addr,
    /// The size of the function.
    pub size: u64,
}


fn trim_start(bytes: &[u8]) -> &[u8] {
    let idx = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[idx..]
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let idx = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &bytes[..idx]
}


/// Split `line` at the first ASCII whitespace, yielding the component
/// before it and the (whitespace trimmed) remainder.
fn split_component<'line>(
    line: &'line [u8],
    full_line: &[u8],
    component: &str,
) -> Result<(&'line str, &'line [u8])> {
    let idx = line
        .iter()
        .position(u8::is_ascii_whitespace)
        .ok_or_invalid_data(|| {
            format!(
                "failed to find {component} in perf map line: {}",
                String::from_utf8_lossy(full_line)
            )
        })?;
    let (left, right) = line.split_at(idx);
    let left = str::from_utf8(left).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed {component} in perf map line: {}: {err}",
            String::from_utf8_lossy(full_line)
        ))
    })?;
    Ok((left, trim_start(right)))
}

fn parse_hex(s: &str, full_line: &[u8], component: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed {component} in perf map line: {}: {err}",
            String::from_utf8_lossy(full_line)
        ))
    })
}

/// Parse a line of a perf map file.
///
/// Lines have the format `START SIZE symbolname`, where START and SIZE
/// are hex numbers. The symbol name is the remainder of the line and
/// may contain white spaces.
pub(crate) fn parse_perf_map_line(line: &[u8]) -> Result<Function<'_>> {
    let (addr, rest) = split_component(line, line, "start address")?;
    let addr = parse_hex(addr, line, "start address")?;
    let (size, rest) = split_component(rest, line, "size")?;
    let size = parse_hex(size, line, "size")?;

    let name = str::from_utf8(trim_end(rest)).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed symbol name in perf map line: {}: {err}",
            String::from_utf8_lossy(line)
        ))
    })?;
    if name.is_empty() {
        return Err(Error::with_invalid_data(format!(
            "perf map line lacks symbol name: {}",
            String::from_utf8_lossy(line)
        )))
    }

    let function = Function { name, addr, size };
    Ok(function)
}

fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n' || b == b'\r')
        .filter(|line| !line.is_empty())
}

/// Invoke `f` for every well formed line of a perf map.
///
/// Malformed lines are skipped: the map may be appended to
/// concurrently, leaving a partial last line.
pub(crate) fn for_each_function<F>(data: &[u8], mut f: F)
where
    F: FnMut(Function<'_>),
{
    for line in lines(data) {
        match parse_perf_map_line(line) {
            Ok(function) => f(function),
            Err(err) => debug!("ignoring perf map line: {err}"),
        }
    }
}

/// Read the perf map at `path`, invoking `f` for every function in it.
#[cfg_attr(feature = "tracing", crate::log::instrument(skip(f)))]
pub(crate) fn read_perf_map<F>(path: &Path, f: F) -> Result<()>
where
    F: FnMut(Function<'_>),
{
    let mmap =
        Mmap::open(path).with_context(|| format!("failed to open perf map `{}`", path.display()))?;
    let () = for_each_function(&mmap, f);
    Ok(())
}

/// Check whether the file at `path` looks like a perf map, i.e., its
/// first line parses.
pub(crate) fn is_valid_perf_map(path: &Path) -> bool {
    let mmap = match Mmap::open(path) {
        Ok(mmap) => mmap,
        Err(..) => return false,
    };
    let valid = lines(&mmap)
        .next()
        .map(|line| parse_perf_map_line(line).is_ok())
        .unwrap_or(false);
    valid
}

/// Retrieve the path to the perf map file of the process with the given
/// `pid`, relative to the root it would be found in.
///
/// The JIT interface mentions `/tmp` by name specifically, ignoring
/// `TMPDIR` et al, so that is what we work with as well.
pub(crate) fn perf_map_path(pid: Pid) -> PathBuf {
    let pid = pid.resolve();
    Path::new("/tmp").join(format!("perf-{pid}.map"))
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    use tempfile::NamedTempFile;
    use test_log::test;
    use test_tag::tag;


    const SAMPLE_PERF_MAP: &[u8] = br#"7fbf1fc20000 b py::_run_module_as_main:<frozen runpy>
7fbf1fc2000b b py::_get_module_details:<frozen runpy>
7fbf1fc21000 10 [jit] with spaces in name
7fbf1fc21010 0x20 0x-prefixed size
7fbf1fc21030 0 empty_fn
7fbf1fc21040 2"#;


    /// Exercise various error paths of the perf map line parsing logic.
    #[tag(miri)]
    #[test]
    fn perf_map_line_parsing_errors() {
        let result = parse_perf_map_line(b"123");
        assert!(result.is_err(), "{result:?}");

        let result = parse_perf_map_line(b"xxxx b py::foobar");
        assert!(result.is_err(), "{result:?}");

        let result = parse_perf_map_line(b"x\xFFxx b py::foobar");
        assert!(result.is_err(), "{result:?}");

        let result = parse_perf_map_line(b"1234 yyy py::foobar");
        assert!(result.is_err(), "{result:?}");

        let result = parse_perf_map_line(b"1234 b py::\xFFfoobar");
        assert!(result.is_err(), "{result:?}");

        let result = parse_perf_map_line(b"1234 b   ");
        assert!(result.is_err(), "{result:?}");
    }

    /// Make sure that we can parse a valid perf map, skipping malformed
    /// lines.
    #[tag(miri)]
    #[test]
    fn perf_map_parsing() {
        let mut functions = Vec::new();
        let () = for_each_function(SAMPLE_PERF_MAP, |function| {
            functions.push((function.name.to_string(), function.addr, function.size))
        });

        assert_eq!(
            functions,
            vec![
                (
                    "py::_run_module_as_main:<frozen runpy>".to_string(),
                    0x7fbf1fc20000,
                    0xb
                ),
                (
                    "py::_get_module_details:<frozen runpy>".to_string(),
                    0x7fbf1fc2000b,
                    0xb
                ),
                ("[jit] with spaces in name".to_string(), 0x7fbf1fc21000, 0x10),
                ("0x-prefixed size".to_string(), 0x7fbf1fc21010, 0x20),
                ("empty_fn".to_string(), 0x7fbf1fc21030, 0),
            ]
        );
    }

    /// Check that we can tell perf maps from other files.
    #[test]
    fn perf_map_validity() {
        let mut file = NamedTempFile::new().unwrap();
        let () = file.write_all(SAMPLE_PERF_MAP).unwrap();
        assert!(is_valid_perf_map(file.path()));

        let mut functions = 0;
        let () = read_perf_map(file.path(), |_function| functions += 1).unwrap();
        assert_eq!(functions, 5);

        let mut file = NamedTempFile::new().unwrap();
        let () = file.write_all(b"\x7fELF\x02\x01\x01").unwrap();
        assert!(!is_valid_perf_map(file.path()));

        let file = NamedTempFile::new().unwrap();
        assert!(!is_valid_perf_map(file.path()));
        assert!(!is_valid_perf_map(Path::new("/does-not-exist/perf-1.map")));
    }

    /// Check that we construct the expected perf map paths.
    #[tag(miri)]
    #[test]
    fn perf_map_path_construction() {
        let path = perf_map_path(Pid::from(1337));
        assert_eq!(path, Path::new("/tmp/perf-1337.map"));
    }
}
