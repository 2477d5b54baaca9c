use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::{Error, Result};

/// The swap-backed block device the image is written to.
///
/// All transfers are whole pages at absolute byte offsets; a short transfer
/// is an error, there is nothing sensible to do with half a page on either
/// side of a resume.
pub struct ResumeDevice {
    file: File,
    page_size: usize,
}

impl ResumeDevice {
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io("open resume device", e))?;
        Ok(ResumeDevice { file, page_size })
    }

    pub fn from_file(file: File, page_size: usize) -> Self {
        ResumeDevice { file, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Write one page at `offset`. Offset zero is never a valid data
    /// location; it holds the swap header.
    pub fn write_page(&self, buf: &[u8], offset: u64) -> Result<()> {
        if offset == 0 {
            return Err(Error::io(
                "write page",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::io("write page", e))
    }

    pub fn read_page(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io("read page", e))
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("fsync", e))
    }

    /// Kick off writeback of everything queued so far without waiting for
    /// it. Used by the early-writeout mode to overlap disk work with the
    /// snapshot read.
    pub fn start_writeout(&self) {
        unsafe {
            libc::sync_file_range(self.file.as_raw_fd(), 0, 0, libc::SYNC_FILE_RANGE_WRITE);
        }
    }
}
