//! The image layout writer.
//!
//! Presents the scattered swap pages as a stream: every `save_page` call
//! lands on the next offset of the preallocated extent pool, and the pool's
//! own description is spilled to swap as a linked chain of map pages. Every
//! offset handed out is written exactly once.

use std::io;

use crate::extents::{encode_extent_page, ExtentMap, SwapSpace};
use crate::mem::PageBuf;
use crate::{Error, Result};

/// Page-granular positioned I/O on the image target.
///
/// The resume block device in production; any file in tests.
pub trait PageIo: Sync {
    fn write_page_at(&self, page: &[u8], offset: u64) -> io::Result<()>;
    fn read_page_at(&self, page: &mut [u8], offset: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
    /// Hint that queued writes may start hitting the disk. Best effort.
    fn start_writeout(&self) {}
}

impl PageIo for std::fs::File {
    fn write_page_at(&self, page: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.write_all_at(page, offset)
    }

    fn read_page_at(&self, page: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.read_exact_at(page, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }

    fn start_writeout(&self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::sync_file_range(self.as_raw_fd(), 0, 0, libc::SYNC_FILE_RANGE_WRITE);
        }
    }
}

impl PageIo for swsusp_snapdev::ResumeDevice {
    fn write_page_at(&self, page: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file().write_all_at(page, offset)
    }

    fn read_page_at(&self, page: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file().read_exact_at(page, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file().sync_all()
    }

    fn start_writeout(&self) {
        swsusp_snapdev::ResumeDevice::start_writeout(self)
    }
}

/// Write one page to a swap offset. Offset zero is the swap header, never a
/// valid target.
pub(crate) fn write_page(dev: &dyn PageIo, page: &[u8], offset: u64) -> Result<()> {
    if offset == 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(libc::EINVAL)));
    }
    Ok(dev.write_page_at(page, offset)?)
}

/// Swap-backed stream writer for one image.
pub struct SwapWriter<'a> {
    dev: &'a dyn PageIo,
    alloc: &'a dyn SwapSpace,
    page_size: usize,
    compress: bool,
    map: ExtentMap,
    cur_extent: usize,
    /// Offset of the page handed out last; pre-incremented on every
    /// request, so it starts one page short of the first extent.
    cur_offset: u64,
    swap_needed: u64,
    written_data: u64,
    /// Where the first map page will land; recorded in the image header.
    map_start: u64,
    /// Swap slot reserved for the map page currently under construction.
    extents_spc: u64,
    map_page: PageBuf,
}

impl<'a> SwapWriter<'a> {
    /// Set up the writer and reserve the slot of the first map page.
    /// Swap itself is preallocated separately by
    /// [`preallocate`](Self::preallocate).
    pub fn new(
        dev: &'a dyn PageIo,
        alloc: &'a dyn SwapSpace,
        page_size: usize,
        compress: bool,
    ) -> Result<Self> {
        let extents_spc = alloc.alloc_swap_page()?.ok_or(Error::NoSwapSpace)?;
        Ok(SwapWriter {
            dev,
            alloc,
            page_size,
            compress,
            map: ExtentMap::new(page_size),
            cur_extent: 0,
            cur_offset: 0,
            swap_needed: 0,
            written_data: 0,
            map_start: extents_spc,
            extents_spc,
            map_page: PageBuf::new(page_size)?,
        })
    }

    pub fn device(&self) -> &'a dyn PageIo {
        self.dev
    }

    pub fn allocator(&self) -> &'a dyn SwapSpace {
        self.alloc
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn map_start(&self) -> u64 {
        self.map_start
    }

    pub fn written_data(&self) -> u64 {
        self.written_data
    }

    pub fn swap_needed(&self) -> u64 {
        self.swap_needed
    }

    pub fn set_swap_needed(&mut self, bytes: u64) {
        self.swap_needed = bytes;
    }

    pub fn add_swap_needed(&mut self, bytes: u64) {
        self.swap_needed += bytes;
    }

    /// Preallocate the first batch of swap and park the cursor one page
    /// before the first extent, where the first `next_swap_page` picks it
    /// up.
    pub fn preallocate(&mut self) -> Result<()> {
        let first = self.preallocate_batch()?;
        self.cur_offset = first - self.page_size as u64;
        Ok(())
    }

    /// Allocate one batch for the current `swap_needed`. Under compression
    /// the request is halved; if that turns out optimistic, the writer
    /// re-enters here midstream with whatever still remains.
    fn preallocate_batch(&mut self) -> Result<u64> {
        let page_size = self.page_size as u64;
        if self.swap_needed < page_size {
            return Err(Error::NoSwapSpace);
        }
        let mut size = self.swap_needed;
        if self.compress && size > page_size {
            size /= 2;
        }
        self.map.alloc_swap(self.alloc, size)?;
        if self.map.extents().is_empty() {
            return Err(Error::NoSwapSpace);
        }
        self.cur_extent = 0;
        self.cur_offset = self.map.extents()[0].start;
        Ok(self.cur_offset)
    }

    /// Take the next page out of the preallocated pool.
    pub fn next_swap_page(&mut self) -> Result<u64> {
        self.cur_offset += self.page_size as u64;
        if let Some(ext) = self.map.extents().get(self.cur_extent) {
            if self.cur_offset >= ext.start && self.cur_offset < ext.end {
                return Ok(self.cur_offset);
            }
        }

        self.cur_extent += 1;
        if let Some(ext) = self.map.extents().get(self.cur_extent) {
            self.cur_offset = ext.start;
            return Ok(self.cur_offset);
        }

        // The batch is used up: spill its map page and continue from the
        // carried-over extent, if any.
        self.save_extents(false)?;
        self.map.start_next_batch();
        self.preallocate_batch()
    }

    /// Write the map page under construction to its reserved slot.
    ///
    /// Unless this is the final one, a fresh slot is allocated for the next
    /// map page first and recorded in the link; the final page carries a
    /// zero link that terminates the chain.
    pub fn save_extents(&mut self, finish: bool) -> Result<()> {
        let link = if finish {
            0
        } else {
            self.alloc.alloc_swap_page()?.ok_or(Error::NoSwapSpace)?
        };
        encode_extent_page(&mut self.map_page, self.map.extents(), link);
        write_page(self.dev, &self.map_page, self.extents_spc)?;
        self.extents_spc = link;
        Ok(())
    }

    /// Save one page of (post-transform) data.
    pub fn save_page(&mut self, src: &[u8]) -> Result<()> {
        let offset = self.next_swap_page()?;
        write_page(self.dev, src, offset)?;
        self.swap_needed = self.swap_needed.saturating_sub(self.page_size as u64);
        self.written_data += self.page_size as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::decode_extent_page;
    use crate::testutil::{MemDev, MockSwap};

    const PAGE: usize = 4096;

    fn offsets(range: std::ops::Range<u64>) -> Vec<u64> {
        range.map(|i| i * PAGE as u64).collect()
    }

    #[test]
    fn pages_land_on_allocated_offsets_exactly_once() {
        let swap = MockSwap::new(offsets(1..64));
        let dev = MemDev::new(PAGE);
        let mut writer = SwapWriter::new(&dev, &swap, PAGE, false).unwrap();
        writer.set_swap_needed(16 * PAGE as u64);
        writer.preallocate().unwrap();

        let page = vec![7u8; PAGE];
        for _ in 0..16 {
            writer.save_page(&page).unwrap();
        }
        writer.save_extents(true).unwrap();

        assert_eq!(writer.written_data(), 16 * PAGE as u64);
        assert!(dev.duplicate_writes().is_empty());
        // Sixteen data pages plus the terminating map page.
        assert_eq!(dev.pages_written(), 17);
    }

    #[test]
    fn map_chain_covers_every_data_page() {
        // Offsets that never merge force extent churn and a midstream
        // spill under the compression-halving heuristic.
        let scattered: Vec<u64> = (1..400).map(|i| 2 * i * PAGE as u64).collect();
        let swap = MockSwap::new(scattered);
        let dev = MemDev::new(PAGE);
        let mut writer = SwapWriter::new(&dev, &swap, PAGE, true).unwrap();
        writer.set_swap_needed(64 * PAGE as u64);
        writer.preallocate().unwrap();

        let map_start = writer.map_start();
        let page = vec![1u8; PAGE];
        for _ in 0..64 {
            writer.save_page(&page).unwrap();
        }
        writer.save_extents(true).unwrap();
        assert!(dev.duplicate_writes().is_empty());

        // Walk the chain, collecting the map-page offsets and the covered
        // data offsets in chain order.
        let mut covered = Vec::new();
        let mut chain_offsets = vec![map_start];
        let mut link = map_start;
        loop {
            let mut page = vec![0u8; PAGE];
            dev.read_page_at(&mut page, link).unwrap();
            let (extents, next) = decode_extent_page(&page);
            for ext in extents {
                let mut at = ext.start;
                while at < ext.end {
                    covered.push(at);
                    at += PAGE as u64;
                }
            }
            if next == 0 {
                break;
            }
            chain_offsets.push(next);
            link = next;
        }

        // The heuristic halves the first request, so at least one spill
        // must have happened.
        assert!(chain_offsets.len() >= 2, "expected a chained extent map");

        // No offset is covered twice, and the data pages were written in
        // chain order; allocated-but-unwritten slack may trail.
        let unique: std::collections::HashSet<&u64> = covered.iter().collect();
        assert_eq!(unique.len(), covered.len());

        let data_written: Vec<u64> = dev
            .written_offsets()
            .into_iter()
            .filter(|off| !chain_offsets.contains(off))
            .collect();
        assert_eq!(data_written.len(), 64);
        assert_eq!(&covered[..64], &data_written[..]);
    }

    #[test]
    fn exhaustion_midstream_is_no_swap_space() {
        let swap = MockSwap::new(offsets(1..6));
        let dev = MemDev::new(PAGE);
        // One page goes to the map slot, four remain.
        let mut writer = SwapWriter::new(&dev, &swap, PAGE, false).unwrap();
        writer.set_swap_needed(16 * PAGE as u64);
        let err = writer.preallocate().unwrap_err();
        assert!(err.is_no_swap_space());
    }

    #[test]
    fn rejects_offset_zero() {
        let dev = MemDev::new(PAGE);
        let err = write_page(&dev, &vec![0u8; PAGE], 0).unwrap_err();
        match err {
            Error::Io(io) => assert_eq!(io.raw_os_error(), Some(libc::EINVAL)),
            other => panic!("unexpected error: {other}"),
        }
    }
}
