//! Shared fixtures: a scripted swap allocator and an in-memory page device.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use crate::extents::SwapSpace;
use crate::writer::PageIo;
use crate::Result;

/// Hands out a fixed offset sequence, then reports exhaustion.
pub(crate) struct MockSwap {
    offsets: Mutex<std::vec::IntoIter<u64>>,
    avail: u64,
}

impl MockSwap {
    pub(crate) fn new(offsets: Vec<u64>) -> Self {
        let avail = offsets.len() as u64 * 4096;
        MockSwap {
            offsets: Mutex::new(offsets.into_iter()),
            avail,
        }
    }
}

impl SwapSpace for MockSwap {
    fn alloc_swap_page(&self) -> Result<Option<u64>> {
        Ok(self.offsets.lock().unwrap().next())
    }

    fn free_swap_pages(&self) -> Result<()> {
        Ok(())
    }

    fn avail_swap(&self) -> Result<u64> {
        Ok(self.avail)
    }
}

/// Page store keeping everything in memory, recording write order and any
/// double writes.
pub(crate) struct MemDev {
    page_size: usize,
    pages: Mutex<HashMap<u64, Vec<u8>>>,
    order: Mutex<Vec<u64>>,
    duplicates: Mutex<Vec<u64>>,
}

impl MemDev {
    pub(crate) fn new(page_size: usize) -> Self {
        MemDev {
            page_size,
            pages: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            duplicates: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn pages_written(&self) -> usize {
        self.order.lock().unwrap().len()
    }

    pub(crate) fn written_offsets(&self) -> Vec<u64> {
        self.order.lock().unwrap().clone()
    }

    pub(crate) fn duplicate_writes(&self) -> Vec<u64> {
        self.duplicates.lock().unwrap().clone()
    }
}

impl PageIo for MemDev {
    fn write_page_at(&self, page: &[u8], offset: u64) -> io::Result<()> {
        assert_eq!(page.len(), self.page_size);
        let prior = self
            .pages
            .lock()
            .unwrap()
            .insert(offset, page.to_vec());
        if prior.is_some() {
            self.duplicates.lock().unwrap().push(offset);
        }
        self.order.lock().unwrap().push(offset);
        Ok(())
    }

    fn read_page_at(&self, page: &mut [u8], offset: u64) -> io::Result<()> {
        match self.pages.lock().unwrap().get(&offset) {
            Some(data) => page.copy_from_slice(data),
            None => page.fill(0),
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}
