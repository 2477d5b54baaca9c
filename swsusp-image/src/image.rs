//! Putting an image on disk, end to end.
//!
//! The supervisor binary decides *when* to write (freeze, snapshot, retry,
//! commit, power off); everything between "the snapshot is ready" and "the
//! header page is on disk" lives here so it can be driven against plain
//! files and scripted allocators.

use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tracing::info;

use crate::checksum::Checksum;
use crate::compress::compress_slack;
use crate::crypto::CryptoContext;
use crate::extents::SwapSpace;
use crate::header::{ImageFlags, ImageHeader};
use crate::mem::PageBuf;
use crate::pipeline::{
    self, SaveContext, BUFFER_PAGES, ENCRYPT_BUF_PAGES, WRITE_BUFFERS,
};
use crate::writer::{write_page, PageIo, SwapWriter};
use crate::{Error, Result};

/// Knobs of one image write.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub checksum: bool,
    pub compress: bool,
    pub threads: bool,
    pub early_writeout: bool,
    /// Sets PLATFORM_SUSPEND in the header so the resumer re-enters the
    /// firmware the same way.
    pub platform_suspend: bool,
    pub resume_pause: u32,
    pub buffer_pages: usize,
    pub write_buffers: usize,
    pub encrypt_pages: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            checksum: false,
            compress: false,
            threads: false,
            early_writeout: false,
            platform_suspend: false,
            resume_pause: 0,
            buffer_pages: BUFFER_PAGES,
            write_buffers: WRITE_BUFFERS,
            encrypt_pages: ENCRYPT_BUF_PAGES,
        }
    }
}

pub struct WriteParams<'a> {
    pub config: &'a ImageConfig,
    pub crypto: Option<&'a CryptoContext>,
    /// Logical image size in bytes; zero means the kernel cannot report it
    /// and the size is read out of the image's own first page.
    pub image_size: u64,
    pub abort: Option<&'a AtomicBool>,
    pub progress: Option<&'a mut dyn FnMut(u32)>,
}

/// What ended up on disk.
pub struct WriteOutcome {
    pub header: ImageHeader,
    /// Swap offset of the header page; recorded into the swap signature by
    /// the commit.
    pub start: u64,
    /// Logical input size in bytes.
    pub image_size: u64,
}

/// Write the whole image: preallocate swap, stream the data through the
/// transforms, then put the header page in place. The swap signature is
/// *not* touched; committing is a separate, deliberate step.
pub fn write_image(
    dev: &dyn PageIo,
    alloc: &dyn SwapSpace,
    input: &mut dyn Read,
    page_size: usize,
    params: WriteParams<'_>,
) -> Result<WriteOutcome> {
    let config = params.config;

    // The header page slot is reserved before anything else so that a
    // failure later never leaves a stale header discoverable.
    let start = alloc.alloc_swap_page()?.ok_or(Error::NoSwapSpace)?;

    let mut writer = SwapWriter::new(dev, alloc, page_size, config.compress)?;

    let mut preloaded = Vec::new();
    let (image_size, nr_pages) = if params.image_size > 0 {
        let pages = params.image_size.div_ceil(page_size as u64);
        (params.image_size, pages)
    } else {
        // Old kernels cannot report the size; the image's first page is
        // the kernel's own header and carries it. Read it ahead, it still
        // has to be written out as ordinary data.
        let mut page = vec![0u8; page_size];
        if !pipeline::read_full_page(input, &mut page)? {
            return Err(Error::Corrupt("empty snapshot stream"));
        }
        let (pages, size) = kernel_image_sizes(&page)?;
        preloaded = page;
        (size, pages)
    };
    info!(image_size, nr_pages, "snapshot ready, writing image");

    writer.set_swap_needed(image_size);
    if config.compress {
        // The image may be incompressible; reserve for the worst case.
        writer.add_swap_needed(compress_slack(image_size, page_size));
    }

    let estimate = if config.compress {
        writer.swap_needed() / 2
    } else {
        writer.swap_needed()
    };
    let free_swap = alloc.avail_swap()?;
    info!(free_swap, "checking free swap");
    if free_swap <= estimate {
        return Err(Error::NoSwapSpace);
    }

    writer.preallocate()?;

    let mut header = ImageHeader {
        pages: nr_pages,
        map_start: writer.map_start(),
        resume_pause: config.resume_pause,
        ..ImageHeader::default()
    };
    if config.checksum {
        header.flags |= ImageFlags::CHECKSUM;
    }
    if config.compress {
        header.flags |= ImageFlags::COMPRESSED;
    }
    if let Some(crypto) = params.crypto {
        header.flags |= ImageFlags::ENCRYPTED;
        header.salt = crypto.salt();
        if let Some(blob) = crypto.rsa_blob() {
            header.flags |= ImageFlags::USE_RSA;
            header.rsa = Some(blob.clone());
        }
    }

    let begin = Instant::now();
    let digest = pipeline::save_image(
        &mut writer,
        input,
        SaveContext {
            config,
            crypto: params.crypto,
            checksum: Checksum::new(config.checksum),
            nr_pages,
            preloaded: &preloaded,
            abort: params.abort,
            progress: params.progress,
        },
    )?;
    dev.sync()?;

    header.image_data_size = writer.written_data();
    header.checksum = digest;
    header.writeout_time = begin.elapsed().as_secs_f64();
    if config.platform_suspend {
        header.flags |= ImageFlags::PLATFORM_SUSPEND;
    }

    let mut page = PageBuf::new(page_size)?;
    header.encode(&mut page);
    write_page(dev, &page, start)?;
    dev.sync()?;

    if config.compress {
        let ratio = header.image_data_size as f64 / image_size as f64;
        info!(ratio, "compression done");
    }

    Ok(WriteOutcome {
        header,
        start,
        image_size,
    })
}

/// Pull `pages` and `size` out of the kernel's own image header page
/// (`struct swsusp_info`): a utsname block followed by a handful of
/// counters. Only those two fields matter to the writer.
fn kernel_image_sizes(page: &[u8]) -> Result<(u64, u64)> {
    const OFF_PAGES: usize = 424;
    const OFF_SIZE: usize = 432;
    if page.len() < OFF_SIZE + 8 {
        return Err(Error::Corrupt("kernel image header page too small"));
    }
    let pages = u64::from_ne_bytes(page[OFF_PAGES..OFF_PAGES + 8].try_into().unwrap());
    let size = u64::from_ne_bytes(page[OFF_SIZE..OFF_SIZE + 8].try_into().unwrap());
    if pages == 0 {
        return Err(Error::Corrupt("kernel reports an empty image"));
    }
    Ok((pages, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_sizes_parse() {
        let mut page = vec![0u8; 4096];
        page[424..432].copy_from_slice(&100u64.to_ne_bytes());
        page[432..440].copy_from_slice(&(100u64 * 4096).to_ne_bytes());
        let (pages, size) = kernel_image_sizes(&page).unwrap();
        assert_eq!(pages, 100);
        assert_eq!(size, 100 * 4096);
    }

    #[test]
    fn empty_kernel_header_is_rejected() {
        let page = vec![0u8; 4096];
        assert!(kernel_image_sizes(&page).is_err());
    }
}
