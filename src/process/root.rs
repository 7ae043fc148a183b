use std::ffi::OsString;
use std::fs::read_link;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::PathBuf;

use crate::log::debug;
use crate::log::warn;
use crate::util::stat_ino;
use crate::Pid;


/// Inodes of the proc entries whose change indicates that a process
/// exec'ed or moved to a different root or mount namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Snapshot {
    exe: u64,
    root: u64,
    mount_ns: u64,
}

impl Snapshot {
    /// Take a snapshot of the relevant inodes of process `pid`.
    fn take(pid: Pid) -> io::Result<Self> {
        let slf = Self {
            exe: stat_ino(format!("/proc/{pid}/exe"))?,
            root: stat_ino(format!("/proc/{pid}/root"))?,
            mount_ns: stat_ino(format!("/proc/{pid}/ns/mnt"))?,
        };
        Ok(slf)
    }
}


fn open_root(pid: Pid) -> io::Result<File> {
    // The standard library always opens files with `O_CLOEXEC`.
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
        .open(format!("/proc/{pid}/root"))
}


/// A tracker of a process' root directory and mount namespace.
///
/// The tracker keeps a handle to the process' root open, so that files
/// can be looked up relative to it even after the process exited. It
/// furthermore detects whether the process exec'ed a new binary or
/// changed its root or mount namespace, in which case any cached
/// information about its address space is outdated.
#[derive(Debug)]
pub struct ProcessRootTracker {
    pid: Pid,
    /// An `O_PATH` handle to the process' root directory.
    root_fd: Option<File>,
    /// The process' root directory, as reported by the kernel.
    root: Option<PathBuf>,
    /// The process' mount namespace, as reported by the kernel.
    mount_ns: Option<OsString>,
    snapshot: Option<Snapshot>,
}

impl ProcessRootTracker {
    /// Create a tracker for process `pid`.
    ///
    /// Failure to access the process is not fatal. The tracker then
    /// has no root handle and paths are interpreted as seen from our
    /// own mount namespace.
    pub fn new(pid: Pid) -> Self {
        let root_fd = match open_root(pid) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("failed to open root directory of process {pid}: {err}");
                None
            }
        };

        Self {
            pid,
            root_fd,
            root: read_link(format!("/proc/{pid}/root")).ok(),
            mount_ns: read_link(format!("/proc/{pid}/ns/mnt"))
                .ok()
                .map(PathBuf::into_os_string),
            snapshot: Snapshot::take(pid).ok(),
        }
    }

    /// Retrieve the process this tracker is for.
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Re-acquire the handle to the process' root directory if the
    /// process changed its root or mount namespace.
    ///
    /// Returns whether the handle has been replaced. If the process is
    /// gone, or a new handle cannot be opened, the previous one is
    /// kept.
    pub fn refresh_root(&mut self) -> bool {
        let root = read_link(format!("/proc/{}/root", self.pid));
        let mount_ns = read_link(format!("/proc/{}/ns/mnt", self.pid));
        let (root, mount_ns) = match (root, mount_ns) {
            (Ok(root), Ok(mount_ns)) => (root, mount_ns.into_os_string()),
            _ => {
                debug!("process {} is gone; keeping its root", self.pid);
                return false
            }
        };

        let unchanged = self.root.as_ref() == Some(&root)
            && self.mount_ns.as_ref() == Some(&mount_ns);
        if unchanged && self.root_fd.is_some() {
            let () = self.reset();
            return false
        }

        self.root = Some(root);
        self.mount_ns = Some(mount_ns);

        match open_root(self.pid) {
            Ok(file) => {
                debug!("re-opened root directory of process {}", self.pid);
                self.root_fd = Some(file);
                let () = self.reset();
                true
            }
            Err(err) => {
                warn!(
                    "failed to open root directory of process {}: {err}",
                    self.pid
                );
                false
            }
        }
    }

    /// Check whether the process exec'ed or changed its root or mount
    /// namespace since the last snapshot.
    ///
    /// A process that is no longer accessible is not considered stale:
    /// its information can no longer be improved upon.
    pub fn is_stale(&self) -> bool {
        match Snapshot::take(self.pid) {
            Ok(snapshot) => self.snapshot != Some(snapshot),
            Err(..) => false,
        }
    }

    /// Take a new snapshot of the process' state, marking the tracker
    /// as current.
    pub fn reset(&mut self) {
        if let Ok(snapshot) = Snapshot::take(self.pid) {
            self.snapshot = Some(snapshot);
        }
    }

    /// Retrieve the handle to the process' root directory, if any.
    #[inline]
    pub fn root_fd(&self) -> Option<&File> {
        self.root_fd.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::process::Command;
    use std::process::Stdio;

    use scopeguard::defer;
    use test_log::test;


    /// Check that we can track our own process.
    #[test]
    fn self_tracking() {
        let mut tracker = ProcessRootTracker::new(Pid::Slf);
        assert_ne!(format!("{tracker:?}"), "");
        assert_eq!(tracker.pid(), Pid::Slf);
        assert!(tracker.root_fd().is_some());
        assert!(!tracker.is_stale());

        // Nothing changed, so the handle stays the same.
        assert!(!tracker.refresh_root());
        assert!(!tracker.is_stale());
        assert_eq!(tracker.root.as_deref(), Some(Path::new("/")));
    }

    /// Check that a changed snapshot is reported as stale and that a
    /// reset marks the tracker as current again.
    #[test]
    fn staleness_detection() {
        let mut tracker = ProcessRootTracker::new(Pid::Slf);
        let snapshot = tracker.snapshot.unwrap();
        tracker.snapshot = Some(Snapshot {
            exe: snapshot.exe.wrapping_add(1),
            ..snapshot
        });
        assert!(tracker.is_stale());

        let () = tracker.reset();
        assert!(!tracker.is_stale());
    }

    /// Check that a lost handle is re-acquired, even if nothing
    /// changed.
    #[test]
    fn root_reacquisition() {
        let mut tracker = ProcessRootTracker::new(Pid::Slf);
        tracker.root_fd = None;
        assert!(tracker.refresh_root());
        assert!(tracker.root_fd().is_some());
        assert!(!tracker.is_stale());
    }

    /// Check that we keep the root of a process after it exited.
    #[test]
    fn exited_process() {
        let mut child = Command::new("sleep")
            .arg("10")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = Pid::from(child.id());
        let mut tracker = ProcessRootTracker::new(pid);
        assert!(tracker.root_fd().is_some());

        let () = child.kill().unwrap();
        let _status = child.wait().unwrap();

        assert!(!tracker.is_stale());
        assert!(!tracker.refresh_root());
        assert!(tracker.root_fd().is_some());

        let tracker = ProcessRootTracker::new(pid);
        assert!(tracker.root_fd().is_none());
        assert!(!tracker.is_stale());
    }

    /// Check that the handle is usable for lookups in the process'
    /// root.
    #[test]
    fn root_lookup() {
        let mut child = Command::new("sleep")
            .arg("10")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = Pid::from(child.id());
        defer! {
            let _result = child.kill();
            let _status = child.wait();
        }

        let tracker = ProcessRootTracker::new(pid);
        let root = tracker.root_fd().unwrap();
        assert!(root.metadata().unwrap().is_dir());
    }
}
