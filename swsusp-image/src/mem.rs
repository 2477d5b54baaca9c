//! Page-aligned working memory.
//!
//! Everything the writer touches is page-granular, so buffers come from
//! anonymous mappings rather than the general allocator. The mappings also
//! play nicely with `mlockall`: they are faulted in once up front and never
//! grow behind our back while the snapshot is being written.

use std::io;
use std::ops::{Deref, DerefMut};

use memmap2::MmapMut;

/// Host page size; every on-disk offset is a multiple of this.
pub fn page_size() -> usize {
    page_size::get()
}

pub fn round_up_page_size(bytes: u64, page_size: usize) -> u64 {
    let mask = page_size as u64 - 1;
    (bytes + mask) & !mask
}

pub fn round_down_page_size(bytes: u64, page_size: usize) -> u64 {
    bytes & !(page_size as u64 - 1)
}

/// A page-aligned, zero-initialized buffer of a fixed capacity.
pub struct PageBuf {
    map: MmapMut,
}

impl PageBuf {
    pub fn new(bytes: usize) -> io::Result<Self> {
        let map = MmapMut::map_anon(bytes)?;
        Ok(PageBuf { map })
    }
}

impl Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}
