//! Exclusive ownership of a namespace directory.
//!
//! A file-backed namespace is written by one owner at a time; a second
//! owner would overwrite the first one's collection snapshots. Ownership is
//! an OS advisory lock on `.polystore.lock`, which also records the owner's
//! pid so a refused open can say who holds it. Dropping the
//! [`NamespaceLock`] releases it.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".polystore.lock";

#[derive(Debug)]
pub struct NamespaceLock {
    _file: File,
    path: PathBuf,
}

impl NamespaceLock {
    /// Takes ownership of `dir` without waiting.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the namespace already has an owner, otherwise the
    /// I/O error from opening the lock file.
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = platform::lock_exclusive(&file) {
            if e.kind() != ErrorKind::WouldBlock {
                return Err(e);
            }
            let holder = read_holder(&mut file).unwrap_or_else(|| "unknown".to_string());
            return Err(io::Error::new(
                ErrorKind::WouldBlock,
                format!("namespace is owned by process {holder}"),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut pid = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut pid).ok()?;
    let pid = pid.trim();
    (!pid.is_empty()).then(|| pid.to_string())
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::io::AsRawFd;

    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(io::Error::new(ErrorKind::WouldBlock, err));
        }
        Err(err)
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        // SAFETY: the handle belongs to `file`; OVERLAPPED is plain data and
        // zero is its documented initial state.
        let locked = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                file.as_raw_handle() as HANDLE,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if locked == 0 {
            return Err(io::Error::new(ErrorKind::WouldBlock, io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::fs::File;
    use std::io::{self, ErrorKind};

    pub fn lock_exclusive(_file: &File) -> io::Result<()> {
        Err(io::Error::new(ErrorKind::Unsupported, "no file locking on this platform"))
    }
}
