use std::fs::File;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Read;
use std::str::FromStr as _;

use crate::log::warn;
use crate::ErrorExt as _;
use crate::Pid;
use crate::Result;


/// Parse the `Tgid` and (innermost) `NStgid` fields out of a
/// `/proc/<pid>/status` style reader.
fn parse_nspid<R>(reader: R, pid: Pid) -> Result<(Pid, Pid)>
where
    R: Read,
{
    let reader = BufReader::new(reader);
    let (mut tgid, mut nstgid) = (pid, pid);
    let mut found = false;

    for line in reader.lines() {
        let line = line?;
        // Use tgid if CONFIG_PID_NS is not defined.
        if let Some(rest) = line.strip_prefix("Tgid:") {
            if let Some(num) = rest.split_whitespace().next_back() {
                let id = Pid::from_str(num)?;
                tgid = id;
                nstgid = id;
                found = true;
            }
        }
        if let Some(rest) = line.strip_prefix("NStgid:") {
            if let Some(num) = rest.split_whitespace().next_back() {
                nstgid = Pid::from_str(num)?;
                break
            }
        }
    }

    if !found {
        warn!("failed to find Tgid/NStgid information for process {pid}");
    }
    Ok((tgid, nstgid))
}

/// Retrieve the thread group ID of process `pid` as seen from our PID
/// namespace as well as from the process' own, innermost one.
pub(crate) fn get_nspid(pid: Pid) -> Result<(Pid, Pid)> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).with_context(|| format!("failed to open `{path}`"))?;
    parse_nspid(file, pid).with_context(|| format!("failed to parse `{path}`"))
}
