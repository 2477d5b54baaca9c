//! Process- and kernel-side preparation around the actual image write.
//!
//! Everything here is restore-on-drop: the run must leave the console
//! loglevel, swappiness and mounts the way it found them on every path
//! that returns to userspace. (The path that powers the machine off does
//! not care.)

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Make sure descriptors 0..2 exist before we start opening devices, so
/// none of them accidentally becomes stdin.
pub fn ensure_stdio() -> io::Result<()> {
    loop {
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if fd >= 3 {
            unsafe { libc::close(fd) };
            return Ok(());
        }
    }
}

/// Lock everything, present and future, so the writer never pages against
/// the swap it is writing to.
pub fn lock_memory() -> io::Result<()> {
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// After preflight nothing may open files or fork anymore.
pub fn drop_rlimits() {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        libc::setrlimit(libc::RLIMIT_NOFILE, &rlim);
        libc::setrlimit(libc::RLIMIT_NPROC, &rlim);
        libc::setrlimit(libc::RLIMIT_CORE, &rlim);
    }
}

pub fn sync_filesystems() {
    unsafe { libc::sync() };
}

/// A `/proc/sys` integer saved now and restored on drop.
pub struct SavedSysctl {
    path: &'static str,
    saved: Option<i32>,
}

impl SavedSysctl {
    pub fn set(path: &'static str, value: i32) -> Self {
        let saved = Self::read(path);
        if let Err(err) = Self::write(path, value) {
            warn!(path, %err, "could not set sysctl");
        }
        SavedSysctl { path, saved }
    }

    fn read(path: &str) -> Option<i32> {
        let mut text = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut text))
            .ok()?;
        text.split_whitespace().next()?.parse().ok()
    }

    fn write(path: &str, value: i32) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        writeln!(file, "{value}")
    }
}

impl Drop for SavedSysctl {
    fn drop(&mut self) {
        if let Some(saved) = self.saved {
            if let Err(err) = Self::write(self.path, saved) {
                warn!(path = self.path, %err, "could not restore sysctl");
            }
        }
    }
}

pub fn save_console_loglevel(level: i32) -> SavedSysctl {
    SavedSysctl::set("/proc/sys/kernel/printk", level)
}

pub fn save_swappiness(value: i32) -> SavedSysctl {
    SavedSysctl::set("/proc/sys/vm/swappiness", value)
}

/// A private tmpfs holding our own node for the resume block device.
///
/// The node disappears with the unmount, so no other process can grab the
/// device through a name we leave behind, and an S3-resume failure cannot
/// pin a /proc path the way the historical chroot trick could.
pub struct PrivateMount {
    mountpoint: PathBuf,
    pub device: File,
}

impl PrivateMount {
    pub fn with_resume_node(resume_device: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(resume_device)?;
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_block_device() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let rdev = metadata.rdev();

        let mountpoint = PathBuf::from("/dev/shm/s2disk");
        match std::fs::create_dir(&mountpoint) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }

        let target = cstring(&mountpoint)?;
        let ret = unsafe {
            libc::mount(
                b"none\0".as_ptr().cast(),
                target.as_ptr(),
                b"tmpfs\0".as_ptr().cast(),
                0,
                core::ptr::null(),
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let node = mountpoint.join("resume");
        let node_c = cstring(&node)?;
        let made = unsafe { libc::mknod(node_c.as_ptr(), libc::S_IFBLK | 0o600, rdev) };
        if made != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::umount(target.as_ptr()) };
            return Err(err);
        }

        let device = match OpenOptions::new().read(true).write(true).open(&node) {
            Ok(device) => device,
            Err(err) => {
                unsafe { libc::umount(target.as_ptr()) };
                return Err(err);
            }
        };

        std::env::set_current_dir(&mountpoint)?;
        Ok(PrivateMount { mountpoint, device })
    }
}

impl Drop for PrivateMount {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir("/") {
            warn!(%err, "could not leave the private mount");
            return;
        }
        if let Ok(target) = cstring(&self.mountpoint) {
            if unsafe { libc::umount(target.as_ptr()) } != 0 {
                warn!(
                    mountpoint = %self.mountpoint.display(),
                    "could not unmount the private tmpfs"
                );
            }
        }
    }
}

fn cstring(path: &Path) -> io::Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Read a passphrase from the controlling terminal with echo off.
pub fn read_passphrase(prompt: &str) -> io::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    let stdin_fd = libc::STDIN_FILENO;
    let mut termios = unsafe { core::mem::zeroed::<libc::termios>() };
    let have_tty = unsafe { libc::tcgetattr(stdin_fd, &mut termios) } == 0;
    if have_tty {
        let saved = termios;
        termios.c_lflag &= !libc::ECHO;
        unsafe { libc::tcsetattr(stdin_fd, libc::TCSANOW, &termios) };
        let result = read_line();
        unsafe { libc::tcsetattr(stdin_fd, libc::TCSANOW, &saved) };
        writeln!(stderr)?;
        result
    } else {
        read_line()
    }
}

fn read_line() -> io::Result<String> {
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Size of a regular file, rounded down to whole pages; used by the
/// test-file mode.
pub fn test_file_size(file: &mut File, page_size: usize) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(swsusp_image::round_down_page_size(len, page_size))
}
