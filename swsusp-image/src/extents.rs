//! Swap extent allocation and the on-disk extent map.
//!
//! The kernel hands out swap pages one at a time, in no particular order.
//! To keep the map small the allocator packs the offsets into sorted runs of
//! contiguous pages. One page worth of runs plus a link to the next such
//! page forms the on-disk extent map chain the resumer walks to find the
//! image data.

use crate::{Error, Result};

/// Bytes one serialized extent occupies on disk.
pub const EXTENT_SIZE: usize = 16;

/// Usable extent slots per map page; the final slot carries the chain link.
pub const fn max_extents(page_size: usize) -> usize {
    page_size / EXTENT_SIZE - 1
}

/// A run of contiguous swap pages, `[start, end)` in bytes on the resume
/// device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    fn singleton(offset: u64, page_size: usize) -> Self {
        Extent {
            start: offset,
            end: offset + page_size as u64,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Source of swap pages and related bookkeeping, normally the snapshot
/// device. Mocked out in tests to drive the allocator through arbitrary
/// offset sequences.
pub trait SwapSpace: Sync {
    /// Reserve one swap page; `None` once swap is exhausted.
    fn alloc_swap_page(&self) -> Result<Option<u64>>;

    /// Release everything reserved so far.
    fn free_swap_pages(&self) -> Result<()>;

    /// Free swap in bytes.
    fn avail_swap(&self) -> Result<u64>;
}

impl SwapSpace for swsusp_snapdev::SnapshotDevice {
    fn alloc_swap_page(&self) -> Result<Option<u64>> {
        Ok(swsusp_snapdev::SnapshotDevice::alloc_swap_page(self)?)
    }

    fn free_swap_pages(&self) -> Result<()> {
        Ok(swsusp_snapdev::SnapshotDevice::free_swap_pages(self)?)
    }

    fn avail_swap(&self) -> Result<u64> {
        Ok(swsusp_snapdev::SnapshotDevice::avail_swap(self)?)
    }
}

/// One map page's worth of extents under construction.
///
/// Invariants: strictly sorted by `start`, no two extents touch. When the
/// page fills up, the offset that did not fit is parked in `carry` to seed
/// the next batch instead of hiding in a reserved array slot.
pub struct ExtentMap {
    page_size: usize,
    extents: Vec<Extent>,
    carry: Option<Extent>,
}

enum Placement {
    Placed,
    Full,
}

impl ExtentMap {
    pub fn new(page_size: usize) -> Self {
        ExtentMap {
            page_size,
            extents: Vec::with_capacity(max_extents(page_size)),
            carry: None,
        }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn carry(&self) -> Option<Extent> {
        self.carry
    }

    /// Drop the current batch and start the next one from the carried-over
    /// extent, if any.
    pub fn start_next_batch(&mut self) {
        self.extents.clear();
        if let Some(ext) = self.carry.take() {
            self.extents.push(ext);
        }
    }

    /// Allocate swap pages until `target` bytes are covered or the map page
    /// is full. Returns the number of bytes obtained by this call; the
    /// caller decides whether a short batch is acceptable.
    pub fn alloc_swap(&mut self, alloc: &dyn SwapSpace, target: u64) -> Result<u64> {
        debug_assert!(self.carry.is_none(), "previous batch not retired");
        let page_size = self.page_size as u64;
        let mut allocated = 0;

        while allocated < target {
            let offset = alloc
                .alloc_swap_page()?
                .ok_or(Error::NoSwapSpace)?;
            allocated += page_size;
            if let Placement::Full = self.insert(offset) {
                break;
            }
        }
        Ok(allocated)
    }

    /// Place one freshly allocated page offset.
    ///
    /// Extents are page-aligned and never contain an offset twice, so the
    /// candidate either extends the run ending at `offset`, extends the run
    /// starting right after it, or opens a new run. Merges keep the earlier
    /// extent and delete the later one.
    fn insert(&mut self, offset: u64) -> Placement {
        let page_size = self.page_size as u64;
        let idx = self.extents.partition_point(|ext| ext.end < offset);
        let len = self.extents.len();

        if idx < len && self.extents[idx].end == offset {
            self.extents[idx].end = offset + page_size;
            if idx + 1 < len && self.extents[idx].end == self.extents[idx + 1].start {
                self.extents[idx].end = self.extents[idx + 1].end;
                self.extents.remove(idx + 1);
            }
            return Placement::Placed;
        }
        if idx < len && self.extents[idx].start == offset + page_size {
            self.extents[idx].start = offset;
            return Placement::Placed;
        }

        let ext = Extent::singleton(offset, self.page_size);
        if len < max_extents(self.page_size) {
            self.extents.insert(idx, ext);
            Placement::Placed
        } else {
            self.carry = Some(ext);
            Placement::Full
        }
    }
}

/// Serialize one map page: the extents, zero padding, and the link slot.
/// A zero link terminates the chain.
pub fn encode_extent_page(page: &mut [u8], extents: &[Extent], link: u64) {
    let slots = max_extents(page.len());
    assert!(extents.len() <= slots);

    page.fill(0);
    for (i, ext) in extents.iter().enumerate() {
        let at = i * EXTENT_SIZE;
        page[at..at + 8].copy_from_slice(&ext.start.to_le_bytes());
        page[at + 8..at + 16].copy_from_slice(&ext.end.to_le_bytes());
    }
    let at = slots * EXTENT_SIZE;
    page[at..at + 8].copy_from_slice(&link.to_le_bytes());
}

/// Parse a map page back into its extents and the link to the next one.
pub fn decode_extent_page(page: &[u8]) -> (Vec<Extent>, u64) {
    let slots = max_extents(page.len());
    let mut extents = Vec::new();

    for i in 0..slots {
        let at = i * EXTENT_SIZE;
        let ext = Extent {
            start: u64::from_le_bytes(page[at..at + 8].try_into().unwrap()),
            end: u64::from_le_bytes(page[at + 8..at + 16].try_into().unwrap()),
        };
        if ext.is_empty() {
            break;
        }
        extents.push(ext);
    }

    let at = slots * EXTENT_SIZE;
    let link = u64::from_le_bytes(page[at..at + 8].try_into().unwrap());
    (extents, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockSwap;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const PAGE: usize = 4096;

    fn well_formed(map: &ExtentMap) {
        for pair in map.extents().windows(2) {
            assert!(pair[0].start < pair[0].end);
            // Strictly sorted and never touching.
            assert!(pair[0].end < pair[1].start);
        }
        if let Some(last) = map.extents().last() {
            assert!(last.start < last.end);
        }
    }

    #[test]
    fn coalesces_an_ascending_run() {
        let swap = MockSwap::new((1..=8).map(|i| i * PAGE as u64).collect());
        let mut map = ExtentMap::new(PAGE);
        let got = map.alloc_swap(&swap, 8 * PAGE as u64).unwrap();

        assert_eq!(got, 8 * PAGE as u64);
        assert_eq!(
            map.extents(),
            &[Extent {
                start: PAGE as u64,
                end: 9 * PAGE as u64
            }]
        );
    }

    #[test]
    fn merges_a_bridged_gap() {
        // 1, 3, then 2 joins the two runs into one.
        let p = PAGE as u64;
        let swap = MockSwap::new(vec![p, 3 * p, 2 * p]);
        let mut map = ExtentMap::new(PAGE);
        map.alloc_swap(&swap, 3 * p).unwrap();

        assert_eq!(
            map.extents(),
            &[Extent {
                start: p,
                end: 4 * p
            }]
        );
    }

    #[test]
    fn prepends_a_descending_run() {
        let p = PAGE as u64;
        let swap = MockSwap::new(vec![9 * p, 8 * p, 7 * p]);
        let mut map = ExtentMap::new(PAGE);
        map.alloc_swap(&swap, 3 * p).unwrap();

        assert_eq!(
            map.extents(),
            &[Extent {
                start: 7 * p,
                end: 10 * p
            }]
        );
    }

    #[test]
    fn exhaustion_is_no_swap_space() {
        let p = PAGE as u64;
        let swap = MockSwap::new(vec![p, 2 * p]);
        let mut map = ExtentMap::new(PAGE);
        let err = map.alloc_swap(&swap, 8 * p).unwrap_err();
        assert!(err.is_no_swap_space());
    }

    #[test]
    fn overflow_parks_the_last_extent_in_the_carry() {
        let p = PAGE as u64;
        // Only even page numbers: nothing ever merges, one extent each.
        let offsets: Vec<u64> = (1..).map(|i| 2 * i * p).take(300).collect();
        let swap = MockSwap::new(offsets);
        let mut map = ExtentMap::new(PAGE);

        let want = 300 * p;
        let got = map.alloc_swap(&swap, want).unwrap();

        // The batch stops at capacity with the unplaced extent carried over.
        let max = max_extents(PAGE) as u64;
        assert_eq!(got, (max + 1) * p);
        assert_eq!(map.extents().len(), max as usize);
        let carry = map.carry().unwrap();
        assert_eq!(carry.len(), p);

        // The carry seeds the next batch.
        map.start_next_batch();
        assert_eq!(map.extents(), &[carry]);
        assert!(map.carry().is_none());
    }

    #[test]
    fn extent_page_round_trip() {
        let p = PAGE as u64;
        let extents = vec![
            Extent { start: p, end: 3 * p },
            Extent {
                start: 5 * p,
                end: 6 * p,
            },
        ];
        let mut page = vec![0u8; PAGE];
        encode_extent_page(&mut page, &extents, 42 * p);

        let (decoded, link) = decode_extent_page(&page);
        assert_eq!(decoded, extents);
        assert_eq!(link, 42 * p);
    }

    #[test]
    fn terminator_page_has_zero_link() {
        let mut page = vec![0u8; PAGE];
        encode_extent_page(&mut page, &[], 0);
        let (decoded, link) = decode_extent_page(&page);
        assert!(decoded.is_empty());
        assert_eq!(link, 0);
    }

    proptest! {
        // Any offset sequence leaves the array sorted and non-touching, with
        // every allocated page covered exactly once across extents + carry.
        #[test]
        fn allocation_preserves_invariants(
            raw in proptest::collection::hash_set(1u64..2048, 1..600)
        ) {
            let offsets: Vec<u64> = raw.iter().map(|i| i * PAGE as u64).collect();
            let distinct: HashSet<u64> = offsets.iter().copied().collect();
            let swap = MockSwap::new(offsets.clone());
            let mut map = ExtentMap::new(PAGE);

            let target = offsets.len() as u64 * PAGE as u64;
            let got = map.alloc_swap(&swap, target).unwrap();
            well_formed(&map);

            let mut covered = HashSet::new();
            let carry = map.carry();
            let all = map.extents().iter().chain(carry.iter());
            for ext in all {
                let mut at = ext.start;
                while at < ext.end {
                    // Exactly once: duplicates must never occur.
                    prop_assert!(covered.insert(at));
                    at += PAGE as u64;
                }
            }

            prop_assert_eq!(covered.len() as u64 * PAGE as u64, got);
            prop_assert!(covered.is_subset(&distinct));
        }

        // Sum of extent lengths equals the page count handed out.
        #[test]
        fn conservation(
            raw in proptest::collection::hash_set(1u64..512, 1..200)
        ) {
            let offsets: Vec<u64> = raw.iter().map(|i| i * PAGE as u64).collect();
            let count = offsets.len() as u64;
            let swap = MockSwap::new(offsets);
            let mut map = ExtentMap::new(PAGE);
            let got = map.alloc_swap(&swap, count * PAGE as u64).unwrap();

            let total: u64 = map
                .extents()
                .iter()
                .chain(map.carry().iter())
                .map(Extent::len)
                .sum();
            prop_assert_eq!(total, got);
        }
    }
}
