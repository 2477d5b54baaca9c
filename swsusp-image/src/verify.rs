//! Re-reading a written image.
//!
//! Walks the extent-map chain exactly the way the resumer will, inverts the
//! transforms, and checks the plaintext digest against the header. Nothing
//! here consults the writer's in-memory state beyond the cipher keys; if
//! this pass succeeds, the on-disk image is self-contained.

use tracing::info;

use crate::checksum::Checksum;
use crate::compress::{compress_buf_size, Decompressor, FRAME_PREFIX};
use crate::crypto::{CryptoContext, PageDecryptor};
use crate::extents::{decode_extent_page, Extent};
use crate::header::{ImageFlags, ImageHeader};
use crate::mem::PageBuf;
use crate::writer::PageIo;
use crate::{Error, Result};

/// Data-page offsets in chain order.
struct ChainWalk<'a> {
    dev: &'a dyn PageIo,
    page_size: usize,
    extents: std::vec::IntoIter<Extent>,
    cur: Option<Extent>,
    next_link: u64,
}

impl<'a> ChainWalk<'a> {
    fn new(dev: &'a dyn PageIo, page_size: usize, map_start: u64) -> Result<Self> {
        let mut walk = ChainWalk {
            dev,
            page_size,
            extents: Vec::new().into_iter(),
            cur: None,
            next_link: map_start,
        };
        walk.load_map_page()?;
        Ok(walk)
    }

    fn load_map_page(&mut self) -> Result<()> {
        if self.next_link == 0 {
            return Ok(());
        }
        let mut page = vec![0u8; self.page_size];
        self.dev.read_page_at(&mut page, self.next_link)?;
        let (extents, link) = decode_extent_page(&page);
        self.extents = extents.into_iter();
        self.cur = None;
        self.next_link = link;
        Ok(())
    }

    fn next_offset(&mut self) -> Result<Option<u64>> {
        loop {
            if let Some(ext) = &mut self.cur {
                if ext.start < ext.end {
                    let offset = ext.start;
                    ext.start += self.page_size as u64;
                    return Ok(Some(offset));
                }
                self.cur = None;
            }
            match self.extents.next() {
                Some(ext) => self.cur = Some(ext),
                None => {
                    if self.next_link == 0 {
                        return Ok(None);
                    }
                    self.load_map_page()?;
                }
            }
        }
    }
}

/// Sequential post-transform pages of the image, decrypted on the fly.
struct ImageData<'a> {
    walk: ChainWalk<'a>,
    dev: &'a dyn PageIo,
    decryptor: Option<PageDecryptor>,
    page: PageBuf,
    remaining_pages: u64,
}

impl<'a> ImageData<'a> {
    fn next_page(&mut self) -> Result<&[u8]> {
        if self.remaining_pages == 0 {
            return Err(Error::Corrupt("read past the end of the image"));
        }
        let offset = self
            .walk
            .next_offset()?
            .ok_or(Error::Corrupt("extent chain shorter than the image"))?;
        self.dev.read_page_at(&mut self.page, offset)?;
        if let Some(dec) = &mut self.decryptor {
            dec.decrypt_page(&mut self.page);
        }
        self.remaining_pages -= 1;
        Ok(&self.page)
    }
}

/// Re-read the image described by `header` and verify the digest.
pub fn verify_image(
    dev: &dyn PageIo,
    crypto: Option<&CryptoContext>,
    header: &ImageHeader,
    page_size: usize,
    buffer_pages: usize,
) -> Result<()> {
    if header.flags.contains(ImageFlags::ENCRYPTED) && crypto.is_none() {
        return Err(Error::Crypto("no key material to verify an encrypted image".into()));
    }

    let page_size_u = page_size as u64;
    let total_pages = header.image_data_size / page_size_u;
    let mut data = ImageData {
        walk: ChainWalk::new(dev, page_size, header.map_start)?,
        dev,
        decryptor: crypto.map(CryptoContext::decryptor).transpose()?,
        page: PageBuf::new(page_size)?,
        remaining_pages: total_pages,
    };

    let mut digest = Checksum::new(true);
    let mut plain_total: u64 = 0;

    if header.flags.contains(ImageFlags::COMPRESSED) {
        let buffer_size = buffer_pages * page_size;
        let frame_cap = compress_buf_size(buffer_size, page_size);
        let mut decompressor = Decompressor::new();
        let mut frame = Vec::with_capacity(frame_cap);
        // Room past the batch so inflate can signal the stream end.
        let mut plain = PageBuf::new(buffer_size + page_size)?;

        while data.remaining_pages > 0 {
            let first = data.next_page()?;
            let size =
                u64::from_le_bytes(first[..FRAME_PREFIX].try_into().unwrap()) as usize;
            if size == 0 || size > frame_cap {
                return Err(Error::Corrupt("implausible compressed batch size"));
            }
            frame.clear();
            frame.extend_from_slice(&first[FRAME_PREFIX..]);
            while frame.len() < size {
                frame.extend_from_slice(data.next_page()?);
            }
            let n = decompressor.decompress_batch(&frame[..size], &mut plain)?;
            digest.update(&plain[..n]);
            plain_total += n as u64;
        }
    } else {
        for _ in 0..total_pages {
            let page = data.next_page()?;
            digest.update(page);
        }
        plain_total = total_pages * page_size_u;
    }

    if plain_total != header.pages * page_size_u {
        return Err(Error::Corrupt("image does not decode to the advertised pages"));
    }

    if header.flags.contains(ImageFlags::CHECKSUM) && digest.finish() != header.checksum {
        return Err(Error::ChecksumMismatch);
    }
    info!(pages = header.pages, "image verified");
    Ok(())
}
