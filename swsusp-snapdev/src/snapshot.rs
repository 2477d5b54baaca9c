use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use tracing::debug;

use crate::ioctl::*;
use crate::{Error, Result};

/// Outcome of the atomic snapshot call.
///
/// The control call semantically returns twice: once right after the kernel
/// built the image (the caller should now write it out), and once more in a
/// different process incarnation after the image was restored on a later
/// boot. There is no continuation machinery behind this; it is a single
/// ioctl whose out-parameter tells the two returns apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    /// The image is in RAM and waits to be written out.
    Snapshotted,
    /// We are running again after a successful resume.
    Resumed,
}

/// Control handle for the kernel snapshot device (`/dev/snapshot`).
pub struct SnapshotDevice {
    file: File,
}

impl SnapshotDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| Error::io("open snapshot device", e))?;
        Ok(SnapshotDevice { file })
    }

    /// Stop all user tasks. Must be undone with [`unfreeze`](Self::unfreeze)
    /// on every path that does not end in a power transition.
    pub fn freeze(&self) -> Result<()> {
        self.none("freeze", SNAPSHOT_FREEZE)
    }

    pub fn unfreeze(&self) -> Result<()> {
        self.none("unfreeze", SNAPSHOT_UNFREEZE)
    }

    /// Build the atomic in-memory image.
    pub fn create_image(&self) -> Result<Snapshot> {
        let mut in_suspend: libc::c_int = 0;
        self.fallback_ptr(
            "create image",
            SNAPSHOT_CREATE_IMAGE,
            SNAPSHOT_ATOMIC_SNAPSHOT,
            &mut in_suspend as *mut libc::c_int as *mut libc::c_void,
        )?;
        debug!(in_suspend, "atomic snapshot returned");
        Ok(if in_suspend != 0 {
            Snapshot::Snapshotted
        } else {
            Snapshot::Resumed
        })
    }

    /// Drop the in-RAM snapshot.
    pub fn free_snapshot(&self) -> Result<()> {
        self.none("free snapshot", SNAPSHOT_FREE)
    }

    /// Release every swap page handed out by
    /// [`alloc_swap_page`](Self::alloc_swap_page).
    pub fn free_swap_pages(&self) -> Result<()> {
        self.none("free swap pages", SNAPSHOT_FREE_SWAP_PAGES)
    }

    /// Free swap on the resume device, in bytes.
    pub fn avail_swap(&self) -> Result<u64> {
        let mut bytes: libc::loff_t = 0;
        self.fallback_ptr(
            "query available swap",
            SNAPSHOT_AVAIL_SWAP_SIZE,
            SNAPSHOT_AVAIL_SWAP,
            &mut bytes as *mut libc::loff_t as *mut libc::c_void,
        )?;
        Ok(bytes as u64)
    }

    /// The kernel's estimate of the image size, in bytes. Zero means the
    /// kernel is too old to report it and the size has to be read out of the
    /// image's own first page instead.
    pub fn image_size(&self) -> Result<u64> {
        let mut bytes: libc::loff_t = 0;
        match self.ptr(
            "query image size",
            SNAPSHOT_GET_IMAGE_SIZE,
            &mut bytes as *mut libc::loff_t as *mut libc::c_void,
        ) {
            Ok(()) => Ok(bytes as u64),
            Err(Error::Io { source, .. }) if source.raw_os_error() == Some(libc::ENOTTY) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Hint the preferred image size to the kernel; it will shrink the
    /// snapshot to approach it. Zero asks for the minimum possible image.
    pub fn set_image_size(&self, bytes: u64) -> Result<()> {
        self.fallback_val(
            "set preferred image size",
            SNAPSHOT_PREF_IMAGE_SIZE,
            SNAPSHOT_SET_IMAGE_SIZE,
            bytes as libc::c_ulong,
        )
    }

    /// Reserve one swap page; `None` when swap is exhausted.
    pub fn alloc_swap_page(&self) -> Result<Option<u64>> {
        let mut offset: libc::loff_t = 0;
        self.fallback_ptr(
            "allocate swap page",
            SNAPSHOT_ALLOC_SWAP_PAGE,
            SNAPSHOT_GET_SWAP_PAGE,
            &mut offset as *mut libc::loff_t as *mut libc::c_void,
        )?;
        Ok(if offset == 0 {
            None
        } else {
            Some(offset as u64)
        })
    }

    /// Bind the resume device so the kernel knows where the image will live.
    pub fn set_swap_area(&self, dev: libc::dev_t, offset: u64) -> Result<()> {
        let area = ResumeSwapArea {
            offset: offset as libc::loff_t,
            dev: dev as u32,
        };
        let ret = unsafe {
            libc::ioctl(
                self.raw_fd(),
                SNAPSHOT_SET_SWAP_AREA as libc::c_ulong,
                &area as *const ResumeSwapArea,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // The old interface can only address a whole swap partition.
        if offset == 0 && err.raw_os_error() == Some(libc::ENOTTY) {
            return self.val(
                "set swap area (legacy)",
                SNAPSHOT_SET_SWAP_FILE,
                dev as libc::c_ulong,
            );
        }
        Err(Error::io("set swap area", err))
    }

    /// Ask the platform firmware to get ready for hibernation.
    pub fn platform_prepare(&self) -> Result<()> {
        self.fallback_val(
            "platform prepare",
            SNAPSHOT_PLATFORM_SUPPORT,
            SNAPSHOT_PMOPS,
            PMOPS_PREPARE,
        )
    }

    /// Enter the platform hibernation state. Does not return on success.
    pub fn platform_enter(&self) -> Result<()> {
        self.fallback_val(
            "platform enter",
            SNAPSHOT_POWER_OFF,
            SNAPSHOT_PMOPS,
            PMOPS_ENTER,
        )
    }

    /// Suspend to RAM with the image already primed on disk.
    pub fn suspend_to_ram(&self) -> Result<()> {
        self.none("suspend to RAM", SNAPSHOT_S2RAM)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn none(&self, op: &'static str, req: u64) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.raw_fd(), req as libc::c_ulong, 0) };
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::io(op, io::Error::last_os_error()))
        }
    }

    fn val(&self, op: &'static str, req: u64, val: libc::c_ulong) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.raw_fd(), req as libc::c_ulong, val) };
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::io(op, io::Error::last_os_error()))
        }
    }

    fn ptr(&self, op: &'static str, req: u64, arg: *mut libc::c_void) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.raw_fd(), req as libc::c_ulong, arg) };
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::io(op, io::Error::last_os_error()))
        }
    }

    fn fallback_ptr(
        &self,
        op: &'static str,
        modern: u64,
        legacy: u64,
        arg: *mut libc::c_void,
    ) -> Result<()> {
        match self.ptr(op, modern, arg) {
            Err(Error::Io { source, .. }) if source.raw_os_error() == Some(libc::ENOTTY) => {
                debug!(op, "falling back to legacy opcode");
                match self.ptr(op, legacy, arg) {
                    Err(Error::Io { source, .. })
                        if source.raw_os_error() == Some(libc::ENOTTY) =>
                    {
                        Err(Error::Unsupported { op })
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn fallback_val(
        &self,
        op: &'static str,
        modern: u64,
        legacy: u64,
        val: libc::c_ulong,
    ) -> Result<()> {
        match self.val(op, modern, val) {
            Err(Error::Io { source, .. }) if source.raw_os_error() == Some(libc::ENOTTY) => {
                debug!(op, "falling back to legacy opcode");
                match self.val(op, legacy, val) {
                    Err(Error::Io { source, .. })
                        if source.raw_os_error() == Some(libc::ENOTTY) =>
                    {
                        Err(Error::Unsupported { op })
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

/// Image pages are pulled straight off the device once the snapshot exists.
impl Read for SnapshotDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Power the machine off through the reboot syscall. Only returns on error.
pub fn power_off() -> io::Error {
    unsafe {
        libc::sync();
        libc::reboot(libc::RB_POWER_OFF);
    }
    io::Error::last_os_error()
}

/// Reboot the machine. Only returns on error.
pub fn reboot() -> io::Error {
    unsafe {
        libc::sync();
        libc::reboot(libc::RB_AUTOBOOT);
    }
    io::Error::last_os_error()
}
