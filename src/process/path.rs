use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd as _;
use std::os::fd::FromRawFd as _;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::path::PathBuf;

use crate::log::debug;
use crate::Pid;


/// Open `path`, interpreted relative to the directory `dir`.
fn open_at(dir: &File, path: &Path) -> Option<File> {
    let path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: `dir` is a valid file descriptor and `path` a valid NUL
    //         terminated string.
    let fd = unsafe {
        libc::openat(
            dir.as_raw_fd(),
            path.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return None
    }
    // SAFETY: `fd` is a freshly opened file descriptor that we own.
    Some(unsafe { File::from_raw_fd(fd) })
}


/// A resolver of the path to a file as seen by some process, usable
/// from our mount namespace.
///
/// Files of a process living in a different mount namespace are
/// reached through `/proc/<pid>/root`, which only works as long as the
/// process is alive. The resolver additionally pins the file by keeping
/// it open, so that it remains accessible via `/proc/self/fd/<fd>`
/// after the process exited.
#[derive(Debug)]
pub struct ModulePathResolver {
    /// The path as seen inside the process' mount namespace.
    ns_path: PathBuf,
    /// The path, prefixed with the process' root.
    root_path: PathBuf,
    /// The path to use if `root_path` became unusable.
    fallback_path: PathBuf,
    /// The pinned file, if any.
    _pinned: Option<File>,
}

impl ModulePathResolver {
    /// Create a resolver for `ns_path`, a path in the mount namespace of
    /// process `pid`.
    ///
    /// If `enter_ns` is `false` paths are used as-is. Otherwise they are
    /// looked up relative to the process' root, `root_fd`.
    pub fn new<P>(ns_path: P, root_fd: Option<&File>, pid: Pid, enter_ns: bool) -> Self
    where
        P: Into<PathBuf>,
    {
        let ns_path = ns_path.into();
        if !enter_ns {
            return Self {
                root_path: ns_path.clone(),
                fallback_path: ns_path.clone(),
                ns_path,
                _pinned: None,
            }
        }

        let rel_path = ns_path.strip_prefix("/").unwrap_or(&ns_path);
        let root_path = Path::new(&format!("/proc/{pid}/root")).join(rel_path);
        let pinned = root_fd.and_then(|root_fd| open_at(root_fd, rel_path));
        let fallback_path = match &pinned {
            Some(file) => PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd())),
            None => {
                debug!(
                    "failed to pin `{}` of process {pid}",
                    ns_path.display()
                );
                root_path.clone()
            }
        };

        Self {
            ns_path,
            root_path,
            fallback_path,
            _pinned: pinned,
        }
    }

    /// Retrieve the path to use for accessing the file.
    ///
    /// This is the path relative to the process' root for as long as
    /// that is accessible, and the path to the pinned file otherwise.
    pub fn path(&self) -> &Path {
        if self.fallback_path == self.root_path || self.root_path.exists() {
            &self.root_path
        } else {
            &self.fallback_path
        }
    }

    /// Retrieve the path relative to the process' root, irrespective of
    /// whether it is accessible.
    #[inline]
    pub fn alt_path(&self) -> &Path {
        &self.root_path
    }

    /// Retrieve the path as seen inside the process' mount namespace.
    #[inline]
    pub fn namespaced_path(&self) -> &Path {
        &self.ns_path
    }
}
