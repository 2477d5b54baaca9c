//! Batch compression.
//!
//! Each full work buffer is compressed into a framed block `{size, data}`
//! placed at the head of a write buffer, then written out in whole pages.
//! The frame length prefix lets the verify pass find the batch boundaries
//! again without any out-of-band information.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::mem::round_up_page_size;
use crate::{Error, Result};

/// Bytes of the length prefix in front of each compressed batch.
pub const FRAME_PREFIX: usize = core::mem::size_of::<u64>();

/// Extra bytes a compressed batch may need over its input.
///
/// The classic worst-case expansion bound, kept as the allocator contract:
/// the writer must succeed even when every batch is incompressible.
pub fn compress_slack(bytes: u64, page_size: usize) -> u64 {
    round_up_page_size((bytes >> 4) + 67 + FRAME_PREFIX as u64, page_size)
}

/// Capacity a write buffer needs to hold one worst-case batch.
pub fn compress_buf_size(buffer_size: usize, page_size: usize) -> usize {
    buffer_size + compress_slack(buffer_size as u64, page_size) as usize
}

pub struct Compressor {
    raw: Compress,
}

impl Compressor {
    pub fn new() -> Self {
        Compressor {
            // Raw deflate; the frame prefix is all the container we need.
            raw: Compress::new(Compression::fast(), false),
        }
    }

    /// Compress one batch into `dst`, returning the framed length
    /// (prefix + compressed bytes). `dst` must be sized by
    /// [`compress_buf_size`] so the worst case always fits.
    pub fn compress_batch(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.raw.reset();
        let mut consumed = 0usize;
        let mut produced = FRAME_PREFIX;

        loop {
            let in_before = self.raw.total_in();
            let out_before = self.raw.total_out();
            let status = self
                .raw
                .compress(&src[consumed..], &mut dst[produced..], FlushCompress::Finish)
                .map_err(|_| Error::Corrupt("deflate failed"))?;
            consumed += (self.raw.total_in() - in_before) as usize;
            produced += (self.raw.total_out() - out_before) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok if produced < dst.len() => continue,
                // Out of output space: the slack reservation was violated.
                _ => return Err(Error::Corrupt("compressed batch overflow")),
            }
        }

        let compressed = (produced - FRAME_PREFIX) as u64;
        dst[..FRAME_PREFIX].copy_from_slice(&compressed.to_le_bytes());
        Ok(produced)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Decompressor {
    raw: Decompress,
}

impl Decompressor {
    pub fn new() -> Self {
        Decompressor {
            raw: Decompress::new(false),
        }
    }

    /// Inflate one framed batch (without its prefix) into `dst`, returning
    /// the plaintext length.
    pub fn decompress_batch(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.raw.reset(false);
        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            let in_before = self.raw.total_in();
            let out_before = self.raw.total_out();
            let status = self
                .raw
                .decompress(&src[consumed..], &mut dst[produced..], FlushDecompress::Finish)
                .map_err(|_| Error::Corrupt("inflate failed"))?;
            consumed += (self.raw.total_in() - in_before) as usize;
            produced += (self.raw.total_out() - out_before) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok if produced < dst.len() => continue,
                _ => return Err(Error::Corrupt("decompressed batch overflow")),
            }
        }

        Ok(produced)
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn round_trip_compressible() {
        let src = vec![0xAA; 8 * PAGE];
        let mut framed = vec![0u8; compress_buf_size(src.len(), PAGE)];
        let mut compressor = Compressor::new();
        let len = compressor.compress_batch(&src, &mut framed).unwrap();

        // Constant input shrinks dramatically.
        assert!(len < src.len() / 4);

        let size = u64::from_le_bytes(framed[..FRAME_PREFIX].try_into().unwrap()) as usize;
        assert_eq!(FRAME_PREFIX + size, len);

        let mut plain = vec![0u8; src.len() + PAGE];
        let got = Decompressor::new()
            .decompress_batch(&framed[FRAME_PREFIX..len], &mut plain)
            .unwrap();
        assert_eq!(got, src.len());
        assert_eq!(&plain[..got], &src[..]);
    }

    #[test]
    fn incompressible_fits_the_slack() {
        // A cheap PRNG so the test is deterministic.
        let mut state = 0x243f_6a88_85a3_08d3u64;
        let src: Vec<u8> = (0..8 * PAGE)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect();

        let mut framed = vec![0u8; compress_buf_size(src.len(), PAGE)];
        let len = Compressor::new().compress_batch(&src, &mut framed).unwrap();
        assert!(len <= framed.len());

        let mut plain = vec![0u8; src.len() + PAGE];
        let got = Decompressor::new()
            .decompress_batch(&framed[FRAME_PREFIX..len], &mut plain)
            .unwrap();
        assert_eq!(got, src.len());
        assert_eq!(&plain[..got], &src[..]);
    }

    #[test]
    fn compressor_state_resets_between_batches() {
        let mut compressor = Compressor::new();
        let a = vec![1u8; 2 * PAGE];
        let b = vec![2u8; 2 * PAGE];
        let mut framed_a = vec![0u8; compress_buf_size(a.len(), PAGE)];
        let mut framed_b = vec![0u8; compress_buf_size(b.len(), PAGE)];

        let la = compressor.compress_batch(&a, &mut framed_a).unwrap();
        let lb = compressor.compress_batch(&b, &mut framed_b).unwrap();

        let mut plain = vec![0u8; 2 * PAGE + PAGE];
        let mut decompressor = Decompressor::new();
        let got = decompressor
            .decompress_batch(&framed_a[FRAME_PREFIX..la], &mut plain)
            .unwrap();
        assert_eq!(&plain[..got], &a[..]);
        let got = decompressor
            .decompress_batch(&framed_b[FRAME_PREFIX..lb], &mut plain)
            .unwrap();
        assert_eq!(&plain[..got], &b[..]);
    }
}
